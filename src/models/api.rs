use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{ConversionJob, JobStatus};
use super::task::{TaskHandle, TaskStateKind};

/// Request for a presigned upload URL.
#[derive(Debug, Deserialize, Validate)]
pub struct UploadRequest {
    #[garde(length(min = 1, max = 255))]
    pub filename: String,

    #[garde(skip)]
    pub content_type: Option<String>,

    #[garde(range(min = 0))]
    pub size: Option<i64>,
}

/// Presigned PUT URL for uploading a CAD file, keyed by the new job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresignedUpload {
    pub url: String,
    pub object_uuid: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct UploadFinishedRequest {
    pub object_uuid: Uuid,
}

#[derive(Debug, Serialize)]
pub struct UploadFinishedResponse {
    pub status: String,
    pub uuid: Uuid,
    pub file_status: JobStatus,
}

/// Durable record as exposed to clients.
#[derive(Debug, Serialize)]
pub struct ConversionJobResponse {
    pub uuid: Uuid,
    pub filename: String,
    pub file_size: Option<i64>,
    pub blob_url: Option<String>,
    pub render_blob_url: Option<String>,
    pub metadata_json: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub status: JobStatus,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<ConversionJob> for ConversionJobResponse {
    fn from(job: ConversionJob) -> Self {
        Self {
            uuid: job.id,
            filename: job.filename,
            file_size: job.file_size,
            blob_url: job.input_url,
            render_blob_url: job.output_url,
            metadata_json: job.metadata,
            error_message: job.error,
            status: job.status,
            uploaded_at: job.uploaded_at,
            processed_at: job.processed_at,
        }
    }
}

/// Merged answer of the status resolver.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_state: Option<TaskStateKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RenderDownloadUrlResponse {
    pub download_url: String,
    pub expires_in: u32,
}

#[derive(Debug, Serialize)]
pub struct DeleteFileResponse {
    pub status: String,
    pub message: String,
    pub uuid: Uuid,
}
