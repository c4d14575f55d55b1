//! Contact storage.
//!
//! [`ContactStore`] and [`ContactTransaction`] are the only storage surface the
//! reconciliation core sees. Two backends implement them: the in-memory store
//! and, behind the `persistent` feature, a WAL-backed store that replays into
//! the same in-memory engine.

mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::{InMemoryContactStore, Mutation, StoreConfig};
pub use traits::{ContactStore, ContactTransaction, StorageError};

#[cfg(feature = "persistent")]
pub use persistent::{open_database, PersistentConfig, PersistentContactStore, WAL_FILE};
