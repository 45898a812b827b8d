//! Job submission surface: creation, upload confirmation, listing, deletion.

use chrono::Utc;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::JobError;
use crate::models::api::{PresignedUpload, RenderDownloadUrlResponse};
use crate::models::job::{ConversionJob, JobStatus};
use crate::models::snapshot::SnapshotMetadata;
use crate::models::task::TaskHandle;

/// Key of a job's uploaded CAD file in the input bucket.
pub fn input_key(job_id: Uuid) -> String {
    job_id.to_string()
}

/// Key of a job's converted mesh in the output bucket.
pub fn output_key(job_id: Uuid) -> String {
    format!("{job_id}.glb")
}

/// Create a job awaiting upload and issue the URL to upload its file to.
pub async fn create_job(
    state: &AppState,
    filename: &str,
    size: Option<i64>,
) -> Result<PresignedUpload, JobError> {
    let job = ConversionJob::new(filename, size);
    state.jobs.create(&job).await?;

    let url = state
        .inputs
        .presigned_upload_url(&input_key(job.id), state.presign_expiry_secs)
        .await?;

    tracing::info!(job_id = %job.id, filename = %job.filename, "Conversion job created");

    Ok(PresignedUpload {
        url,
        object_uuid: job.id,
    })
}

/// Mark a job's upload finished and dispatch it for conversion.
///
/// Re-confirming an already uploaded job dispatches it again, so a failed
/// enqueue can be retried by the client.
pub async fn confirm_upload(state: &AppState, job_id: Uuid) -> Result<TaskHandle, JobError> {
    let job = state
        .jobs
        .get(job_id)
        .await?
        .ok_or(JobError::NotFound(job_id))?;

    let prime_cache = match job.status {
        JobStatus::Uploading => {
            let input_url = state.inputs.object_url(&input_key(job_id));
            if !state.jobs.mark_uploaded(job_id, &input_url, Utc::now()).await? {
                let current = current_status(state, job_id).await?;
                return Err(JobError::InvalidTransition {
                    job_id,
                    current,
                    requested: JobStatus::Uploaded,
                });
            }
            true
        }
        JobStatus::Uploaded => {
            tracing::info!(job_id = %job_id, "Upload confirmed again, re-dispatching");
            // An earlier dispatch may already be running; its snapshot stays
            state
                .cache
                .get_status(job_id)
                .await
                .map_or(true, |snapshot| snapshot.status == JobStatus::Uploaded)
        }
        current => {
            return Err(JobError::InvalidTransition {
                job_id,
                current,
                requested: JobStatus::Uploaded,
            })
        }
    };

    // Primed before enqueue so a fast worker's PROCESSING write is never overwritten
    if prime_cache {
        state
            .cache
            .set_status(
                job_id,
                JobStatus::Uploaded,
                None,
                Some(SnapshotMetadata::progress(0, "Queued for conversion")),
            )
            .await;
    }

    let handle = state.queue.enqueue(job_id).await?;
    metrics::counter!("conversion_jobs_total").increment(1);

    tracing::info!(job_id = %job_id, task_id = %handle, "Conversion job dispatched");
    Ok(handle)
}

pub async fn get_job(state: &AppState, job_id: Uuid) -> Result<ConversionJob, JobError> {
    state
        .jobs
        .get(job_id)
        .await?
        .ok_or(JobError::NotFound(job_id))
}

pub async fn list_jobs(state: &AppState) -> Result<Vec<ConversionJob>, JobError> {
    Ok(state.jobs.list().await?)
}

/// Time-limited download URL of a processed job's mesh.
pub async fn render_download_url(
    state: &AppState,
    job_id: Uuid,
) -> Result<RenderDownloadUrlResponse, JobError> {
    let job = get_job(state, job_id).await?;
    if job.status != JobStatus::Processed {
        return Err(JobError::RenderNotReady {
            job_id,
            status: job.status,
        });
    }

    let download_url = state
        .outputs
        .presigned_download_url(&output_key(job_id), state.presign_expiry_secs)
        .await?;

    Ok(RenderDownloadUrlResponse {
        download_url,
        expires_in: state.presign_expiry_secs,
    })
}

/// Delete a job with both of its blobs and its cached status.
///
/// The record goes first. Blob removal is best effort once it is gone, since a
/// leftover object is unreachable while a leftover record points at nothing.
pub async fn delete_job(state: &AppState, job_id: Uuid) -> Result<ConversionJob, JobError> {
    let removed = state
        .jobs
        .delete(job_id)
        .await?
        .ok_or(JobError::NotFound(job_id))?;
    state.cache.delete_status(job_id).await;

    for (bucket, key) in [
        (&state.inputs, input_key(job_id)),
        (&state.outputs, output_key(job_id)),
    ] {
        if let Err(e) = bucket.delete(&key).await {
            tracing::warn!(
                job_id = %job_id,
                bucket = bucket.bucket_name(),
                key = %key,
                error = %e,
                "Blob left behind after job deletion"
            );
        }
    }

    tracing::info!(job_id = %job_id, "Conversion job deleted");
    Ok(removed)
}

async fn current_status(state: &AppState, job_id: Uuid) -> Result<JobStatus, JobError> {
    Ok(get_job(state, job_id).await?.status)
}
