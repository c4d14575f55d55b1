//! Durable contact store.
//!
//! The store is the in-memory engine plus a commit hook: every committed
//! transaction is appended to the write-ahead log before it becomes visible,
//! and the log is replayed into the in-memory table on open.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::contact::Contact;
use crate::error::{ExecutionError, ReconcileError};
use crate::storage::memory::{CommitHook, ContactTable, Mutation, StoreCore};
use crate::storage::traits::{ContactStore, ContactTransaction, StorageError};
use crate::time::Clock;

use super::file_lock::FileLock;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

/// Name of the log file inside the database directory.
pub const WAL_FILE: &str = "contacts.wal";

fn open_err(context: &str, e: impl std::fmt::Display) -> ReconcileError {
    ReconcileError::Execution(ExecutionError::Storage {
        message: format!("{context}: {e}"),
    })
}

/// Contact store backed by a write-ahead log.
///
/// Holds an exclusive lock on its directory for its whole lifetime.
pub struct PersistentContactStore {
    dir: PathBuf,
    _lock: FileLock,
    wal: Arc<WriteAheadLog>,
    core: StoreCore,
    config: PersistentConfig,
}

impl std::fmt::Debug for PersistentContactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentContactStore")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistentContactStore {
    /// Open or create a database directory and replay its log.
    pub fn open(
        dir: &Path,
        config: PersistentConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ReconcileError> {
        fs::create_dir_all(dir)
            .map_err(|e| open_err("failed to create database directory", e))?;

        let lock = FileLock::acquire(dir).map_err(|e| open_err("failed to acquire lock", e))?;

        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| open_err("failed to open write-ahead log", e))?;

        let table = Self::replay(&wal)?;
        tracing::info!(
            dir = %dir.display(),
            contacts = table.len(),
            "contact database opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal: Arc::new(wal),
            core: StoreCore::new(table, clock, config.store.clone()),
            config,
        })
    }

    fn replay(wal: &WriteAheadLog) -> Result<ContactTable, ReconcileError> {
        let iter = wal
            .iter()
            .map_err(|e| open_err("failed to iterate write-ahead log", e))?;

        let mut table = ContactTable::default();
        let mut entries = 0usize;
        for entry in iter {
            let entry = entry.map_err(|e| open_err("corrupted write-ahead log entry", e))?;
            match entry.kind {
                WalEntryKind::Snapshot { contacts } => {
                    table = ContactTable::default();
                    for contact in contacts {
                        table
                            .insert(contact)
                            .map_err(|e| open_err("invalid snapshot", e))?;
                    }
                }
                WalEntryKind::Commit { mutations } => {
                    table.validate(&mutations).map_err(|e| {
                        open_err(&format!("invalid commit at sequence {}", entry.sequence), e)
                    })?;
                    table.apply(&mutations);
                }
            }
            entries += 1;
        }
        tracing::debug!(entries, "write-ahead log replayed");
        Ok(table)
    }

    /// Database directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current log size in bytes.
    pub fn wal_size(&self) -> Result<u64, StorageError> {
        self.wal
            .size_bytes()
            .map_err(|e| StorageError::BackendError(format!("wal size: {e}")))
    }

    /// Rewrite the log as a single snapshot of the committed table.
    pub fn compact(&self) -> Result<(), StorageError> {
        // Commits log under the table lock, so none can land mid-rewrite.
        self.core.with_table(|table| self.compact_table(table))?
    }

    fn compact_table(&self, table: &ContactTable) -> Result<(), StorageError> {
        let contacts: Vec<Contact> = table.contacts().cloned().collect();
        let count = contacts.len();
        self.wal
            .compact(contacts)
            .map_err(|e| StorageError::BackendError(format!("wal compaction failed: {e}")))?;
        tracing::info!(contacts = count, "write-ahead log compacted");
        Ok(())
    }
}

impl CommitHook for PersistentContactStore {
    fn log(&self, mutations: &[Mutation]) -> Result<(), StorageError> {
        self.wal
            .append(WalEntryKind::Commit {
                mutations: mutations.to_vec(),
            })
            .map(|_| ())
            .map_err(|e| StorageError::BackendError(format!("wal append failed: {e}")))
    }

    fn published(&self, table: &ContactTable) {
        match self.wal.size_bytes() {
            Ok(size) if size > self.config.max_wal_size => {
                // The commit is already durable; a failed compaction only
                // leaves a longer log behind.
                if let Err(e) = self.compact_table(table) {
                    tracing::warn!(error = %e, "write-ahead log compaction failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "cannot read write-ahead log size"),
        }
    }
}

impl ContactStore for PersistentContactStore {
    fn begin(&self) -> Result<Box<dyn ContactTransaction + '_>, StorageError> {
        Ok(Box::new(self.core.begin(Some(self))))
    }

    fn len(&self) -> Result<usize, StorageError> {
        self.core.len()
    }

    fn snapshot(&self) -> Result<Vec<Contact>, StorageError> {
        self.core.snapshot()
    }
}
