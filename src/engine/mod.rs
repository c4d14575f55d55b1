//! Transaction coordinator.
//!
//! [`IdentityEngine`] runs one resolution per transaction against a pluggable
//! [`ContactStore`]. Either every write of a resolution commits or none does.
//! Concurrency conflicts (lock timeouts, deadlocks, serialization failures)
//! restart the whole resolution from the locked lookup, a bounded number of
//! times.

/// Worker pool giving every request its own worker.
pub mod runtime;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{ExecutionError, ReconcileError, ReconcileResult};
use crate::request::{IdentifyRequest, Identity};
use crate::resolver::{self, Resolution};
use crate::response::IdentifyResponse;
use crate::storage::ContactStore;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Additional attempts after a concurrency conflict.
    pub max_retries: u32,
    /// Base backoff; attempt `n` waits roughly `n * retry_backoff`.
    pub retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(10),
        }
    }
}

impl EngineConfig {
    const MAX_RETRIES: u32 = 100;

    /// Rejects degenerate settings.
    pub fn validate(self) -> Result<Self, ReconcileError> {
        if self.max_retries > Self::MAX_RETRIES {
            return Err(ReconcileError::internal(format!(
                "max_retries must be at most {} (got {})",
                Self::MAX_RETRIES,
                self.max_retries
            )));
        }
        Ok(self)
    }
}

/// Identity reconciliation engine.
#[derive(Clone)]
pub struct IdentityEngine {
    store: Arc<dyn ContactStore>,
    config: EngineConfig,
}

impl IdentityEngine {
    /// Create a new engine over `store` with default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn ContactStore>) -> Self {
        Self {
            store,
            config: EngineConfig::default(),
        }
    }

    /// Create a new engine with an explicit configuration.
    ///
    /// # Errors
    /// Returns `Internal` if `config` fails [`EngineConfig::validate`].
    pub fn with_config(store: Arc<dyn ContactStore>, config: EngineConfig) -> ReconcileResult<Self> {
        Ok(Self {
            store,
            config: config.validate()?,
        })
    }

    /// Get a reference to the contact store.
    pub fn contact_store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    /// Get the active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate `request`, reconcile it, and format the resulting cluster.
    ///
    /// # Errors
    /// - `Validation` before any store access
    /// - `ConcurrencyConflict` once retries are exhausted
    /// - `IntegrityViolation` / `StorageUnavailable` / `Storage` immediately
    pub fn identify(&self, request: &IdentifyRequest) -> ReconcileResult<IdentifyResponse> {
        let identity = request.validate()?;
        let resolution = self.resolve_identity(&identity)?;
        Ok(IdentifyResponse::from(&resolution))
    }

    /// Like [`identify`](Self::identify) but returns the full resolution.
    pub fn resolve_request(&self, request: &IdentifyRequest) -> ReconcileResult<Resolution> {
        let identity = request.validate()?;
        self.resolve_identity(&identity)
    }

    /// Reconcile an already validated identity.
    pub fn resolve_identity(&self, identity: &Identity) -> ReconcileResult<Resolution> {
        let request_id = Uuid::new_v4();
        let span = tracing::debug_span!("identify", %request_id);
        let _enter = span.enter();

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.attempt(identity) {
                Ok(resolution) => {
                    tracing::debug!(
                        attempt,
                        primary = %resolution.primary_id,
                        members = resolution.contacts.len(),
                        created = resolution.created.is_some(),
                        relinked = resolution.relinked.len(),
                        "resolved"
                    );
                    return Ok(resolution);
                }
                Err(err) if err.is_concurrency_conflict() => {
                    if attempt > self.config.max_retries {
                        tracing::warn!(attempt, error = %err, "giving up after concurrency conflicts");
                        return Err(ReconcileError::Execution(ExecutionError::ConcurrencyConflict {
                            attempts: attempt,
                            message: err.to_string(),
                        }));
                    }
                    let backoff = backoff_for(self.config.retry_backoff, attempt, request_id);
                    tracing::warn!(attempt, ?backoff, error = %err, "concurrency conflict, retrying");
                    thread::sleep(backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn attempt(&self, identity: &Identity) -> ReconcileResult<Resolution> {
        let mut tx = self.store.begin()?;
        match resolver::resolve(&mut *tx, identity.email(), identity.phone_number()) {
            Ok(resolution) => {
                tx.commit()?;
                Ok(resolution)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }
}

/// Linear backoff with a per-request offset so colliding retries spread out.
fn backoff_for(base: Duration, attempt: u32, request_id: Uuid) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    let base_us = u64::try_from(base.as_micros()).unwrap_or(u64::MAX);
    #[allow(clippy::cast_possible_truncation)]
    let jitter = (request_id.as_u128() % u128::from(base_us)) as u64;
    Duration::from_micros(base_us.saturating_mul(u64::from(attempt)).saturating_add(jitter))
}
