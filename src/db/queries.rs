use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{ConversionJob, JobStatus};

const JOB_COLUMNS: &str = "id, filename, file_size, input_url, output_url, status, metadata, \
                           error, created_at, uploaded_at, processed_at";

fn job_from_row(row: &PgRow) -> Result<ConversionJob, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status_str).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(ConversionJob {
        id: row.try_get("id")?,
        filename: row.try_get("filename")?,
        file_size: row.try_get("file_size")?,
        input_url: row.try_get("input_url")?,
        output_url: row.try_get("output_url")?,
        status,
        metadata: row.try_get("metadata")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        uploaded_at: row.try_get("uploaded_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

fn predecessor_names(target: JobStatus) -> Vec<String> {
    target
        .predecessors()
        .iter()
        .map(|s| s.as_ref().to_string())
        .collect()
}

/// Insert a new conversion job
pub async fn insert_job(pool: &PgPool, job: &ConversionJob) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO conversion_jobs (id, filename, file_size, status, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(job.id)
    .bind(&job.filename)
    .bind(job.file_size)
    .bind(job.status.as_ref())
    .bind(job.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<ConversionJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM conversion_jobs WHERE id = $1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// List every job, oldest first
pub async fn list_jobs(pool: &PgPool) -> Result<Vec<ConversionJob>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM conversion_jobs ORDER BY created_at ASC"
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

/// Record a finished upload. Returns false if the job was not awaiting one.
pub async fn mark_uploaded(
    pool: &PgPool,
    job_id: Uuid,
    input_url: &str,
    uploaded_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE conversion_jobs
        SET status = 'uploaded',
            input_url = $2,
            uploaded_at = $3
        WHERE id = $1 AND status = ANY($4)
        "#,
    )
    .bind(job_id)
    .bind(input_url)
    .bind(uploaded_at)
    .bind(predecessor_names(JobStatus::Uploaded))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Move a job into processing (first delivery or redelivery)
pub async fn mark_processing(pool: &PgPool, job_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE conversion_jobs
        SET status = 'processing'
        WHERE id = $1 AND status = ANY($2)
        "#,
    )
    .bind(job_id)
    .bind(predecessor_names(JobStatus::Processing))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Commit a successful conversion
pub async fn mark_processed(
    pool: &PgPool,
    job_id: Uuid,
    output_url: &str,
    metadata: &serde_json::Value,
    processed_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE conversion_jobs
        SET status = 'processed',
            output_url = $2,
            metadata = $3,
            error = NULL,
            processed_at = $4
        WHERE id = $1 AND status = ANY($5)
        "#,
    )
    .bind(job_id)
    .bind(output_url)
    .bind(metadata)
    .bind(processed_at)
    .bind(predecessor_names(JobStatus::Processed))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Commit a failed conversion with its error text
pub async fn mark_failed(
    pool: &PgPool,
    job_id: Uuid,
    error: &str,
    processed_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE conversion_jobs
        SET status = 'failed',
            error = $2,
            processed_at = $3
        WHERE id = $1 AND status = ANY($4)
        "#,
    )
    .bind(job_id)
    .bind(error)
    .bind(processed_at)
    .bind(predecessor_names(JobStatus::Failed))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Delete a job, returning the removed record
pub async fn delete_job(pool: &PgPool, job_id: Uuid) -> Result<Option<ConversionJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "DELETE FROM conversion_jobs WHERE id = $1 RETURNING {JOB_COLUMNS}"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}
