//! Error types for identity reconciliation.
//!
//! All errors are strongly typed using thiserror. Validation failures are
//! separated from execution failures so callers can reject bad input before
//! the reconciliation core ever runs, and so transient concurrency failures
//! can be told apart from fatal ones.

use thiserror::Error;

use crate::contact::ContactId;
use crate::storage::StorageError;

/// Validation errors raised while checking an inbound request.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Either email or phoneNumber must be provided")]
    MissingIdentifier,

    #[error("Invalid email address: '{value}'")]
    InvalidEmail {
        value: String,
    },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        field: String,
        max_length: usize,
    },
}

/// Execution errors raised while resolving a request against the store.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Concurrency conflict after {attempts} attempt(s): {message}")]
    ConcurrencyConflict {
        attempts: u32,
        message: String,
    },

    #[error("Integrity violation: {reason}")]
    IntegrityViolation {
        reason: String,
    },

    #[error("Storage unavailable: {message}")]
    StorageUnavailable {
        message: String,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Queue full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Worker pool disconnected")]
    Disconnected,

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },
}

/// Top-level error type for the crate.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl ReconcileError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an integrity violation.
    #[must_use]
    pub fn integrity(reason: impl Into<String>) -> Self {
        Self::Execution(ExecutionError::IntegrityViolation {
            reason: reason.into(),
        })
    }

    /// Integrity violation for a contact that should exist but does not.
    #[must_use]
    pub fn missing_contact(id: ContactId) -> Self {
        Self::integrity(format!("contact {id} vanished mid-transaction"))
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true for lock waits, deadlocks and serialization failures.
    #[must_use]
    pub const fn is_concurrency_conflict(&self) -> bool {
        matches!(
            self,
            Self::Execution(ExecutionError::ConcurrencyConflict { .. })
        )
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false, // Validation errors won't change on retry
            Self::Execution(e) => matches!(
                e,
                ExecutionError::ConcurrencyConflict { .. }
                    | ExecutionError::QueueFull { .. }
                    | ExecutionError::Timeout { .. }
            ),
            Self::Internal { .. } => false,
        }
    }
}

impl From<StorageError> for ExecutionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::LockTimeout { .. } | StorageError::SerializationFailure(_) => {
                Self::ConcurrencyConflict {
                    attempts: 1,
                    message: err.to_string(),
                }
            }
            StorageError::ConnectionError(message) => Self::StorageUnavailable { message },
            other => Self::Storage {
                message: other.to_string(),
            },
        }
    }
}

impl From<StorageError> for ReconcileError {
    fn from(err: StorageError) -> Self {
        Self::Execution(err.into())
    }
}

/// Result type alias for reconciliation operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;
