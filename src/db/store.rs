//! Durable job store: the system of record for conversion jobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use super::queries;
use crate::models::job::{ConversionJob, JobStatus};

/// Point CRUD over conversion jobs.
///
/// Transition methods are conditional on the job's current status and return
/// `false` when the transition was not applied.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &ConversionJob) -> Result<(), StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<ConversionJob>, StoreError>;

    async fn list(&self) -> Result<Vec<ConversionJob>, StoreError>;

    async fn mark_uploaded(
        &self,
        job_id: Uuid,
        input_url: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn mark_processing(&self, job_id: Uuid) -> Result<bool, StoreError>;

    async fn mark_processed(
        &self,
        job_id: Uuid,
        output_url: &str,
        metadata: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn mark_failed(&self, job_id: Uuid, error: &str, at: DateTime<Utc>)
        -> Result<bool, StoreError>;

    async fn delete(&self, job_id: Uuid) -> Result<Option<ConversionJob>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job store unavailable: {0}")]
    Unavailable(String),
}

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &ConversionJob) -> Result<(), StoreError> {
        Ok(queries::insert_job(&self.pool, job).await?)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<ConversionJob>, StoreError> {
        Ok(queries::get_job(&self.pool, job_id).await?)
    }

    async fn list(&self) -> Result<Vec<ConversionJob>, StoreError> {
        Ok(queries::list_jobs(&self.pool).await?)
    }

    async fn mark_uploaded(
        &self,
        job_id: Uuid,
        input_url: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(queries::mark_uploaded(&self.pool, job_id, input_url, at).await?)
    }

    async fn mark_processing(&self, job_id: Uuid) -> Result<bool, StoreError> {
        Ok(queries::mark_processing(&self.pool, job_id).await?)
    }

    async fn mark_processed(
        &self,
        job_id: Uuid,
        output_url: &str,
        metadata: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(queries::mark_processed(&self.pool, job_id, output_url, metadata, at).await?)
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(queries::mark_failed(&self.pool, job_id, error, at).await?)
    }

    async fn delete(&self, job_id: Uuid) -> Result<Option<ConversionJob>, StoreError> {
        Ok(queries::delete_job(&self.pool, job_id).await?)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// In-memory job store.
///
/// Intended for tests/dev. Applies the same conditional transitions as the
/// SQL store, each under a single write lock.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, ConversionJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(
        &self,
        job_id: Uuid,
        target: JobStatus,
        apply: impl FnOnce(&mut ConversionJob),
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        match jobs.get_mut(&job_id) {
            Some(job) if job.status.can_transition_to(target) => {
                job.status = target;
                apply(job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("in-memory store lock poisoned".to_string())
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &ConversionJob) -> Result<(), StoreError> {
        self.jobs
            .write()
            .map_err(|_| poisoned())?
            .insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<ConversionJob>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| poisoned())?
            .get(&job_id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<ConversionJob>, StoreError> {
        let mut jobs: Vec<ConversionJob> = self
            .jobs
            .read()
            .map_err(|_| poisoned())?
            .values()
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn mark_uploaded(
        &self,
        job_id: Uuid,
        input_url: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.transition(job_id, JobStatus::Uploaded, |job| {
            job.input_url = Some(input_url.to_string());
            job.uploaded_at = Some(at);
        })
    }

    async fn mark_processing(&self, job_id: Uuid) -> Result<bool, StoreError> {
        self.transition(job_id, JobStatus::Processing, |_| {})
    }

    async fn mark_processed(
        &self,
        job_id: Uuid,
        output_url: &str,
        metadata: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.transition(job_id, JobStatus::Processed, |job| {
            job.output_url = Some(output_url.to_string());
            job.metadata = Some(metadata.clone());
            job.error = None;
            job.processed_at = Some(at);
        })
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.transition(job_id, JobStatus::Failed, |job| {
            job.error = Some(error.to_string());
            job.processed_at = Some(at);
        })
    }

    async fn delete(&self, job_id: Uuid) -> Result<Option<ConversionJob>, StoreError> {
        Ok(self.jobs.write().map_err(|_| poisoned())?.remove(&job_id))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
