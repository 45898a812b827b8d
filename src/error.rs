use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use crate::db::store::StoreError;
use crate::models::job::JobStatus;
use crate::services::cache::CacheError;
use crate::services::converter::ConversionError;
use crate::services::queue::QueueError;
use crate::services::storage::StorageError;

/// Failures of the job lifecycle layer.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {job_id} is {current}, cannot move to {requested}")]
    InvalidTransition {
        job_id: Uuid,
        current: JobStatus,
        requested: JobStatus,
    },

    #[error("Job {job_id} has no render yet (status {status})")]
    RenderNotReady { job_id: Uuid, status: JobStatus },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Blob storage error: {0}")]
    UpstreamStorage(#[from] StorageError),

    #[error("Conversion failed: {0}")]
    ConversionFailure(#[from] ConversionError),

    /// Non-fatal: the job still succeeds with placeholder metadata.
    #[error("Metadata extraction degraded: {0}")]
    MetadataExtractionDegraded(String),

    #[error("Task delivery failed: {0}")]
    TaskDelivery(String),

    #[error("Status cache unavailable: {0}")]
    CacheUnavailable(#[from] CacheError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Local staging error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            JobError::NotFound(_) => StatusCode::NOT_FOUND,
            JobError::InvalidTransition { .. } | JobError::RenderNotReady { .. } => {
                StatusCode::CONFLICT
            }
            JobError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            JobError::UpstreamStorage(_) => StatusCode::BAD_GATEWAY,
            JobError::Queue(_) | JobError::CacheUnavailable(_) | JobError::TaskDelivery(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            JobError::ConversionFailure(_)
            | JobError::MetadataExtractionDegraded(_)
            | JobError::Store(_)
            | JobError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}
