use axum::extract::State;
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::error::JobError;
use crate::models::api::{PresignedUpload, UploadFinishedRequest, UploadFinishedResponse, UploadRequest};
use crate::models::job::JobStatus;
use crate::services::jobs;

/// POST /api/v1/upload/presigned-url: create a job and return where to PUT the file.
pub async fn presigned_url(
    State(state): State<AppState>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<PresignedUpload>, JobError> {
    request
        .validate()
        .map_err(|report| JobError::Validation(report.to_string()))?;

    if let Some(content_type) = &request.content_type {
        tracing::debug!(filename = %request.filename, content_type = %content_type, "Upload requested");
    }

    let upload = jobs::create_job(&state, &request.filename, request.size).await?;
    Ok(Json(upload))
}

/// POST /api/v1/upload/finished: confirm the upload and queue the conversion.
pub async fn upload_finished(
    State(state): State<AppState>,
    Json(request): Json<UploadFinishedRequest>,
) -> Result<Json<UploadFinishedResponse>, JobError> {
    jobs::confirm_upload(&state, request.object_uuid).await?;

    Ok(Json(UploadFinishedResponse {
        status: "success".to_string(),
        uuid: request.object_uuid,
        file_status: JobStatus::Uploaded,
    }))
}
