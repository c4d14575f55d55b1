//! Worker-pool runtime for identify requests.
//!
//! `IdentityEngine` is synchronous; every store call may block on a lock. This
//! module gives each inbound request its own worker thread from a small,
//! bounded pool so that a request waiting on a contended identifier never
//! stalls requests on disjoint identifiers.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::engine::IdentityEngine;
use crate::error::{ExecutionError, ReconcileError, ReconcileResult};
use crate::request::IdentifyRequest;
use crate::response::IdentifyResponse;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum queued requests.
    pub queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

enum Job {
    Identify {
        request: IdentifyRequest,
        reply: Sender<ReconcileResult<IdentifyResponse>>,
    },

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Sender<()>,
    },
}

struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    fn start(workers: usize, queue_capacity: usize, engine: &Arc<IdentityEngine>) -> ReconcileResult<Self> {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut pool = Self {
            tx: Some(tx),
            workers: Vec::with_capacity(workers),
            queue_capacity,
        };
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let engine = Arc::clone(engine);
            let handle = thread::Builder::new()
                .name(format!("identity-worker-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        match job {
                            Job::Identify { request, reply } => {
                                let _ = reply.send(engine.identify(&request));
                            }

                            #[cfg(test)]
                            Job::Sleep { duration, reply } => {
                                thread::sleep(duration);
                                let _ = reply.send(());
                            }
                        }
                    }
                })
                .map_err(|e| ReconcileError::internal(format!("failed to spawn identity worker: {e}")));
            match handle {
                Ok(handle) => pool.workers.push(handle),
                Err(err) => {
                    pool.shutdown();
                    return Err(err);
                }
            }
        }
        tracing::debug!(workers, queue_capacity, "identity worker pool started");
        Ok(pool)
    }

    fn try_submit(&self, job: Job) -> ReconcileResult<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(ReconcileError::Execution(ExecutionError::Disconnected));
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ReconcileError::Execution(ExecutionError::QueueFull {
                capacity: self.queue_capacity,
            })),
            Err(TrySendError::Disconnected(_)) => {
                Err(ReconcileError::Execution(ExecutionError::Disconnected))
            }
        }
    }

    fn shutdown(&mut self) {
        // Close the channel: workers will drain queued jobs then exit.
        self.tx = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Handle returned by [`IdentityRuntime::submit`].
pub struct ExecutionHandle {
    rx: Receiver<ReconcileResult<IdentifyResponse>>,
}

impl ExecutionHandle {
    /// Waits for the request to complete.
    pub fn join(self) -> ReconcileResult<IdentifyResponse> {
        self.rx
            .recv()
            .map_err(|_| ReconcileError::Execution(ExecutionError::Disconnected))?
    }

    /// Waits for the request to complete with a timeout.
    ///
    /// A timeout abandons the wait only; the worker still finishes (and
    /// commits or rolls back) the request.
    pub fn join_timeout(self, timeout: Duration) -> ReconcileResult<IdentifyResponse> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ReconcileError::Execution(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => ReconcileError::Execution(ExecutionError::Disconnected),
        })?
    }
}

/// Bounded worker pool in front of an [`IdentityEngine`].
pub struct IdentityRuntime {
    engine: Arc<IdentityEngine>,
    pool: WorkerPool,
}

impl IdentityRuntime {
    /// Start `config.workers` threads serving `engine`.
    ///
    /// # Errors
    /// `Internal` if a worker thread cannot be spawned.
    pub fn new(engine: IdentityEngine, config: RuntimeConfig) -> ReconcileResult<Self> {
        let engine = Arc::new(engine);
        let pool = WorkerPool::start(config.workers, config.queue_capacity, &engine)?;
        Ok(Self { engine, pool })
    }

    /// Queue a request; fails fast with `QueueFull` when saturated.
    pub fn submit(&self, request: IdentifyRequest) -> ReconcileResult<ExecutionHandle> {
        let (tx, rx) = bounded::<ReconcileResult<IdentifyResponse>>(1);
        self.pool.try_submit(Job::Identify { request, reply: tx })?;
        Ok(ExecutionHandle { rx })
    }

    /// Queue a request and wait for it.
    pub fn identify(&self, request: IdentifyRequest) -> ReconcileResult<IdentifyResponse> {
        self.submit(request)?.join()
    }

    /// Returns a shared reference to the underlying engine.
    #[must_use]
    pub fn engine(&self) -> &IdentityEngine {
        &self.engine
    }

    /// Stop accepting requests, drain the queue, and join the workers.
    pub fn shutdown(mut self) {
        self.pool.shutdown();
    }

    #[cfg(test)]
    fn submit_sleep(&self, duration: Duration) -> ReconcileResult<Receiver<()>> {
        let (tx, rx) = bounded::<()>(1);
        self.pool.try_submit(Job::Sleep { duration, reply: tx })?;
        Ok(rx)
    }
}

impl Drop for IdentityRuntime {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}
