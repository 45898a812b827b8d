//! Read path for job status.
//!
//! The only place status is read for clients. A cache snapshot wins when
//! present, enriched by the task's live state; otherwise the durable record
//! answers. Never writes.

use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::JobError;
use crate::models::api::JobStatusResponse;
use crate::models::metadata::ConversionOutput;
use crate::models::snapshot::StatusSnapshot;

/// Merge cache, live task state and durable record into one status answer.
pub async fn resolve_status(state: &AppState, job_id: Uuid) -> Result<JobStatusResponse, JobError> {
    if let Some(snapshot) = state.cache.get_status(job_id).await {
        return Ok(from_snapshot(state, job_id, snapshot).await);
    }

    let job = state
        .jobs
        .get(job_id)
        .await?
        .ok_or(JobError::NotFound(job_id))?;

    Ok(JobStatusResponse {
        job_id,
        status: job.status,
        task_id: None,
        live_state: None,
        progress: None,
        message: None,
        render_url: job.output_url,
        metadata: job.metadata,
        error: job.error,
    })
}

async fn from_snapshot(state: &AppState, job_id: Uuid, snapshot: StatusSnapshot) -> JobStatusResponse {
    let mut response = JobStatusResponse {
        job_id,
        status: snapshot.status,
        task_id: snapshot.task_id,
        live_state: None,
        progress: snapshot.metadata.progress,
        message: snapshot.metadata.message,
        render_url: snapshot.metadata.render_url,
        metadata: None,
        error: snapshot.metadata.error,
    };

    let Some(handle) = response.task_id.clone() else {
        return response;
    };

    let live = match state.queue.task_state(&handle).await {
        Ok(Some(live)) => live,
        Ok(None) => return response,
        Err(e) => {
            tracing::warn!(job_id = %job_id, task_id = %handle, error = %e, "Live task state unavailable");
            return response;
        }
    };

    response.live_state = Some(live.state);
    if let Some(result) = live.result {
        match serde_json::from_value::<ConversionOutput>(result.clone()) {
            Ok(output) => {
                response.render_url = Some(output.render_url);
                response.metadata = serde_json::to_value(output.metadata).ok();
            }
            Err(_) => response.metadata = Some(result),
        }
    }
    if let Some(error) = live.error {
        response.error = Some(error);
    }

    response
}
