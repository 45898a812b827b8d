use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::db::store::{JobStore, MemoryJobStore, PgJobStore};
use crate::error::JobError;
use crate::services::cache::{MemoryCache, RedisCache, StatusCache};
use crate::services::queue::{DispatchPolicy, MemoryQueue, RedisTaskQueue, TaskQueue};
use crate::services::storage::{BlobStore, MemoryBlobStore, S3BlobStore};

/// Shared context built once at process start and passed to every component.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub inputs: Arc<dyn BlobStore>,
    pub outputs: Arc<dyn BlobStore>,
    pub cache: StatusCache,
    pub queue: Arc<dyn TaskQueue>,
    pub presign_expiry_secs: u32,
}

impl AppState {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        inputs: Arc<dyn BlobStore>,
        outputs: Arc<dyn BlobStore>,
        cache: StatusCache,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            jobs,
            inputs,
            outputs,
            cache,
            queue,
            presign_expiry_secs: 3600,
        }
    }

    /// Production collaborators: Postgres, both S3 buckets, and the two Redis instances.
    pub fn connect(
        config: &AppConfig,
        pool: PgPool,
        policy: DispatchPolicy,
    ) -> Result<Self, JobError> {
        let inputs = S3BlobStore::new(
            &config.input_bucket,
            &config.blob_endpoint,
            &config.blob_region,
            &config.blob_access_key,
            &config.blob_secret_key,
        )?;
        let outputs = S3BlobStore::new(
            &config.output_bucket,
            &config.blob_endpoint,
            &config.blob_region,
            &config.blob_access_key,
            &config.blob_secret_key,
        )?;
        let cache = StatusCache::new(
            Arc::new(RedisCache::new(&config.redis_data_url)?),
            config.status_ttl(),
        );
        let queue = RedisTaskQueue::new(&config.redis_queue_url, policy)?;

        Ok(Self::new(
            Arc::new(PgJobStore::new(pool)),
            Arc::new(inputs),
            Arc::new(outputs),
            cache,
            Arc::new(queue),
        )
        .with_presign_expiry(config.presign_expiry_secs))
    }

    /// Create the input and output buckets if they do not exist yet.
    pub async fn ensure_buckets(&self) -> Result<(), JobError> {
        self.inputs.ensure_bucket().await?;
        self.outputs.ensure_bucket().await?;
        Ok(())
    }

    pub fn with_presign_expiry(mut self, secs: u32) -> Self {
        self.presign_expiry_secs = secs;
        self
    }
}

/// In-memory collaborators behind an [`AppState`], for tests and local development.
pub struct MemoryBackends {
    pub jobs: Arc<MemoryJobStore>,
    pub inputs: Arc<MemoryBlobStore>,
    pub outputs: Arc<MemoryBlobStore>,
    pub cache: Arc<MemoryCache>,
    pub queue: Arc<MemoryQueue>,
}

impl MemoryBackends {
    pub fn new(policy: DispatchPolicy) -> Self {
        Self {
            jobs: Arc::new(MemoryJobStore::new()),
            inputs: Arc::new(MemoryBlobStore::new("stepfiles")),
            outputs: Arc::new(MemoryBlobStore::new("renders")),
            cache: Arc::new(MemoryCache::new()),
            queue: Arc::new(MemoryQueue::new(policy)),
        }
    }

    pub fn state(&self) -> AppState {
        AppState::new(
            self.jobs.clone(),
            self.inputs.clone(),
            self.outputs.clone(),
            StatusCache::new(self.cache.clone(), Duration::from_secs(3600)),
            self.queue.clone(),
        )
    }
}
