//! HTTP helpers for end-to-end tests against a running API server and worker.

use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// Response from POST /api/v1/upload/presigned-url
#[derive(Debug, Deserialize)]
pub struct PresignedUpload {
    pub url: String,
    pub object_uuid: Uuid,
}

/// Response from GET /api/v1/files/{uuid}/status
#[derive(Debug, Deserialize)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub status: String,
    pub task_id: Option<String>,
    pub progress: Option<u8>,
    pub render_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub error: Option<String>,
}

pub fn base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

/// Request an upload URL, PUT the file to blob storage, and confirm the upload.
pub async fn upload_file(
    client: &reqwest::Client,
    base_url: &str,
    filename: &str,
    contents: Vec<u8>,
) -> Result<Uuid, Box<dyn std::error::Error>> {
    let upload: PresignedUpload = client
        .post(format!("{base_url}/api/v1/upload/presigned-url"))
        .json(&serde_json::json!({ "filename": filename, "size": contents.len() }))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    client
        .put(&upload.url)
        .body(contents)
        .send()
        .await?
        .error_for_status()?;

    client
        .post(format!("{base_url}/api/v1/upload/finished"))
        .json(&serde_json::json!({ "object_uuid": upload.object_uuid }))
        .send()
        .await?
        .error_for_status()?;

    Ok(upload.object_uuid)
}

/// Poll job status until processed or failed (with timeout)
pub async fn wait_for_terminal_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: Uuid,
    timeout_secs: u64,
) -> Result<JobStatus, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms
    let mut last_progress = None;

    for _ in 0..max_attempts {
        let status: JobStatus = client
            .get(format!("{base_url}/api/v1/files/{job_id}/status"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match status.status.as_str() {
            "processed" | "failed" => return Ok(status),
            "uploading" | "uploaded" | "processing" => {
                if status.progress != last_progress {
                    println!("  ... {} at {:?}%", status.status, status.progress);
                    last_progress = status.progress;
                }
                sleep(Duration::from_millis(500)).await;
            }
            other => return Err(format!("Unknown job status: {other}").into()),
        }
    }

    Err(format!("Job did not finish within {timeout_secs} seconds").into())
}
