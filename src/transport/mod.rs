//! gRPC transport layer.
//!
//! Handlers never run reconciliation on the async executor: each request is
//! handed to the [`IdentityRuntime`] worker pool and awaited through
//! `spawn_blocking`, since a worker may block on contended contact locks.

use std::sync::Arc;

use serde::Serialize;
use tonic::{Request, Response, Status};

use crate::engine::runtime::IdentityRuntime;
use crate::error::{ExecutionError, ReconcileError};
use crate::request::IdentifyRequest;
use crate::response::{ContactSummary, IdentifyResponse};

#[allow(missing_docs, clippy::pedantic)]
pub mod proto {
    tonic::include_proto!("identity");
}

use proto::identity_service_server::{IdentityService, IdentityServiceServer};

/// Body returned by the health probe.
pub const HEALTH_MESSAGE: &str = "Identity Reconciliation Service is running.";

/// Maximum size of a JSON request body.
const MAX_REQUEST_JSON_BYTES: usize = 64 * 1024;

/// gRPC service implementation.
pub struct IdentityServiceImpl {
    runtime: Arc<IdentityRuntime>,
}

impl IdentityServiceImpl {
    /// Serve requests on `runtime`.
    #[must_use]
    pub fn new(runtime: Arc<IdentityRuntime>) -> Self {
        Self { runtime }
    }

    /// Wrap in the generated tonic server.
    #[must_use]
    pub fn into_server(self) -> IdentityServiceServer<Self> {
        IdentityServiceServer::new(self)
    }

    async fn run(&self, request: IdentifyRequest) -> Result<IdentifyResponse, Status> {
        let runtime = Arc::clone(&self.runtime);
        tokio::task::spawn_blocking(move || runtime.identify(request))
            .await
            .map_err(|e| Status::internal(format!("identify task failed: {e}")))?
            .map_err(status_from_error)
    }
}

/// Maps a reconciliation failure to a gRPC status.
///
/// Internal failures carry a generic message; details go to the log.
#[must_use]
pub fn status_from_error(err: ReconcileError) -> Status {
    match err {
        ReconcileError::Validation(v) => Status::invalid_argument(v.to_string()),
        ReconcileError::Execution(e) => match e {
            ExecutionError::ConcurrencyConflict { .. } | ExecutionError::StorageUnavailable { .. } => {
                Status::unavailable(e.to_string())
            }
            ExecutionError::QueueFull { .. } => Status::resource_exhausted(e.to_string()),
            ExecutionError::Timeout { .. } => Status::deadline_exceeded(e.to_string()),
            ExecutionError::IntegrityViolation { .. }
            | ExecutionError::Storage { .. }
            | ExecutionError::Disconnected => {
                tracing::error!(error = %e, "identify failed");
                Status::internal("identify failed")
            }
        },
        ReconcileError::Internal { message } => {
            tracing::error!(%message, "identify failed");
            Status::internal("identify failed")
        }
    }
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, Status> {
    serde_json::to_vec(value)
        .map_err(|e| Status::internal(format!("failed to serialize response JSON: {e}")))
}

impl From<proto::IdentifyRequest> for IdentifyRequest {
    fn from(req: proto::IdentifyRequest) -> Self {
        Self {
            email: req.email,
            phone_number: req.phone_number,
        }
    }
}

impl From<ContactSummary> for proto::ContactSummary {
    fn from(summary: ContactSummary) -> Self {
        Self {
            primary_contact_id: summary.primary_contact_id.get(),
            emails: summary.emails,
            phone_numbers: summary.phone_numbers,
            secondary_contact_ids: summary
                .secondary_contact_ids
                .into_iter()
                .map(|id| id.get())
                .collect(),
        }
    }
}

#[tonic::async_trait]
impl IdentityService for IdentityServiceImpl {
    async fn identify(
        &self,
        request: Request<proto::IdentifyRequest>,
    ) -> Result<Response<proto::IdentifyReply>, Status> {
        let resp = self.run(request.into_inner().into()).await?;
        Ok(Response::new(proto::IdentifyReply {
            contact: Some(resp.contact.into()),
        }))
    }

    async fn identify_json(
        &self,
        request: Request<proto::JsonRequest>,
    ) -> Result<Response<proto::JsonReply>, Status> {
        let body = request.into_inner().body_json;
        if body.is_empty() {
            return Err(Status::invalid_argument("body_json is required"));
        }
        if body.len() > MAX_REQUEST_JSON_BYTES {
            return Err(Status::invalid_argument("body_json exceeds maximum size"));
        }
        let req: IdentifyRequest = serde_json::from_slice(&body)
            .map_err(|e| Status::invalid_argument(format!("invalid request JSON: {e}")))?;

        let resp = self.run(req).await?;
        Ok(Response::new(proto::JsonReply {
            body_json: encode_json(&resp)?,
        }))
    }

    async fn health(
        &self,
        _request: Request<proto::HealthRequest>,
    ) -> Result<Response<proto::HealthReply>, Status> {
        Ok(Response::new(proto::HealthReply {
            message: HEALTH_MESSAGE.to_string(),
        }))
    }
}
