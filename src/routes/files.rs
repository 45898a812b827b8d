use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::JobError;
use crate::models::api::{
    ConversionJobResponse, DeleteFileResponse, JobStatusResponse, RenderDownloadUrlResponse,
};
use crate::services::{jobs, status};

/// GET /api/v1/files
pub async fn list_files(
    State(state): State<AppState>,
) -> Result<Json<Vec<ConversionJobResponse>>, JobError> {
    let files = jobs::list_jobs(&state).await?;
    Ok(Json(files.into_iter().map(Into::into).collect()))
}

/// GET /api/v1/files/{uuid}: the durable record.
pub async fn get_file(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ConversionJobResponse>, JobError> {
    Ok(Json(jobs::get_job(&state, job_id).await?.into()))
}

/// GET /api/v1/files/{uuid}/status: live status, cache first.
pub async fn file_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, JobError> {
    Ok(Json(status::resolve_status(&state, job_id).await?))
}

/// GET /api/v1/files/{uuid}/render-url
pub async fn render_url(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<RenderDownloadUrlResponse>, JobError> {
    Ok(Json(jobs::render_download_url(&state, job_id).await?))
}

/// DELETE /api/v1/files/{uuid}
pub async fn delete_file(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<DeleteFileResponse>, JobError> {
    let removed = jobs::delete_job(&state, job_id).await?;

    Ok(Json(DeleteFileResponse {
        status: "success".to_string(),
        message: format!("File {} deleted", removed.filename),
        uuid: job_id,
    }))
}
