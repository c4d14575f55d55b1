//! Abstract storage traits for contacts.
//!
//! The reconciliation core only needs the handful of transactional operations
//! defined here. Backends decide how locks are taken; the contract is that a
//! lock taken by [`ContactTransaction::lock_matching`] is held until the
//! transaction commits or rolls back.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::contact::{Contact, ContactId, LinkPrecedence, NewContact};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Contact not found.
    #[error("Contact not found: {0}")]
    ContactNotFound(ContactId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Gave up waiting for a lock (contention or deadlock).
    #[error("Lock wait timed out on {key}")]
    LockTimeout {
        /// The lock key that could not be acquired.
        key: String,
    },

    /// State observed under lock no longer matches what was read before it.
    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// A contact store that hands out transactions.
pub trait ContactStore: Send + Sync {
    /// Begin a new transaction.
    fn begin(&self) -> Result<Box<dyn ContactTransaction + '_>, StorageError>;

    /// Number of stored contacts (committed state).
    fn len(&self) -> Result<usize, StorageError>;

    /// Returns true if no contact has been committed.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Committed snapshot of every contact, ordered by id.
    fn snapshot(&self) -> Result<Vec<Contact>, StorageError>;
}

/// One unit of work against a [`ContactStore`].
///
/// Writes are invisible to other transactions until [`commit`](Self::commit).
/// Dropping a transaction without committing rolls it back.
pub trait ContactTransaction {
    /// Lock and return every contact whose email equals `email` or whose phone
    /// equals `phone`, ordered by `created_at` (ties: id).
    ///
    /// An omitted identifier matches nothing.
    fn lock_matching(
        &mut self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError>;

    /// First contact matching either identifier, as visible to this transaction.
    fn find_matching(
        &mut self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Option<Contact>, StorageError>;

    /// Get a contact by id.
    fn find_by_id(&mut self, id: ContactId) -> Result<Option<Contact>, StorageError>;

    /// Every contact whose id is in `roots` or whose `linked_id` is in `roots`,
    /// ordered by `created_at` (ties: id).
    fn find_cluster_members(
        &mut self,
        roots: &BTreeSet<ContactId>,
    ) -> Result<Vec<Contact>, StorageError>;

    /// Insert a contact, assigning id and timestamps.
    fn create(&mut self, contact: NewContact) -> Result<Contact, StorageError>;

    /// Change a contact's linkage.
    fn update(
        &mut self,
        id: ContactId,
        linked_id: Option<ContactId>,
        precedence: LinkPrecedence,
    ) -> Result<(), StorageError>;

    /// Make every staged write visible atomically and release locks.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Discard staged writes and release locks.
    fn rollback(self: Box<Self>);
}
