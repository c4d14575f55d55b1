//! Persistent storage backend.
//!
//! A database is a directory holding:
//! - `.lock`, held exclusively by the owning process
//! - `contacts.wal`, the write-ahead log of committed transactions
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │              PersistentContactStore              │
//! ├──────────────────────────────────────────────────┤
//! │  ┌───────────────┐        ┌──────────────────┐   │
//! │  │   StoreCore   │ commit │  WriteAheadLog   │   │
//! │  │ (locks, table)│ ─────► │  (append-only)   │   │
//! │  └───────────────┘        └────────┬─────────┘   │
//! │                                    ↓             │
//! │                       ┌─────────────────────┐    │
//! │                       │  FileLock (flock)   │    │
//! │                       └─────────────────────┘    │
//! └──────────────────────────────────────────────────┘
//! ```

mod codec;
mod file_lock;
mod stores;
mod wal;

pub use file_lock::FileLock;
pub use stores::{PersistentContactStore, WAL_FILE};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;
use std::sync::Arc;

use crate::error::{ExecutionError, ReconcileError};
use crate::storage::memory::StoreConfig;
use crate::time::SystemClock;

/// Configuration for persistent storage.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// Log size that triggers compaction (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every commit.
    pub sync_on_write: bool,
    /// Lock settings of the underlying store.
    pub store: StoreConfig,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024,
            sync_on_write: true,
            store: StoreConfig::default(),
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// Rejects degenerate settings.
    pub fn validate(self) -> Result<Self, ReconcileError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ReconcileError::Execution(ExecutionError::Storage {
                message: format!(
                    "max_wal_size must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            }));
        }
        let store = self.store.validate()?;
        Ok(Self { store, ..self })
    }
}

/// Open or create a contact database at `path`.
///
/// # Errors
/// - If the path cannot be created or accessed
/// - If another process holds the lock
/// - If the log contains an entry that does not apply cleanly
///
/// # Example
/// ```rust,ignore
/// use identity_reconciler::storage::persistent::open_database;
///
/// let store = open_database("./contacts.idrc", None)?;
/// let engine = IdentityEngine::new(Arc::new(store));
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<PersistentContactStore, ReconcileError> {
    let cfg = config.unwrap_or_default().validate()?;
    PersistentContactStore::open(path.as_ref(), cfg, Arc::new(SystemClock))
}
