//! Ephemeral status cache.
//!
//! Snapshots are stored twice: under the job id and under the task handle
//! that last wrote them. Both entries carry a sliding TTL refreshed on every
//! write. The cache is advisory, so every operation swallows backend errors
//! and degrades to a miss.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::models::job::JobStatus;
use crate::models::snapshot::{SnapshotMetadata, StatusSnapshot};
use crate::models::task::TaskHandle;

const STATUS_PREFIX: &str = "file_status:";
const TASK_PREFIX: &str = "task_id:";

/// Minimal TTL key-value backend behind the status cache.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn del(&self, key: &str) -> Result<(), CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Cache unavailable")]
    Unavailable,
}

/// Redis-backed cache storage.
pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    pub fn new(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// In-memory TTL cache.
///
/// Intended for tests/dev. Can be switched offline to simulate an outage.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    offline: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .get(key)
                    .is_some_and(|(_, expires)| *expires > Instant::now())
            })
            .unwrap_or(false)
    }

    fn check_online(&self) -> Result<(), CacheError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check_online()?;
        let mut entries = self.entries.lock().map_err(|_| CacheError::Unavailable)?;
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.check_online()?;
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable)?
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.check_online()?;
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable)?
            .remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.check_online()
    }
}

/// Best-effort job status snapshots with a sliding TTL.
#[derive(Clone)]
pub struct StatusCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl StatusCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn status_key(job_id: Uuid) -> String {
        format!("{STATUS_PREFIX}{job_id}")
    }

    pub fn task_key(handle: &TaskHandle) -> String {
        format!("{TASK_PREFIX}{handle}")
    }

    /// Overwrite the job's snapshot, and the task-keyed copy when a handle is given.
    pub async fn set_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        task_id: Option<&TaskHandle>,
        metadata: Option<SnapshotMetadata>,
    ) {
        let snapshot = StatusSnapshot {
            status,
            task_id: task_id.cloned(),
            metadata: metadata.unwrap_or_default(),
        };
        if let Err(e) = self.write_snapshot(job_id, &snapshot).await {
            tracing::warn!(job_id = %job_id, status = %status, error = %e, "Status cache write skipped");
        }
    }

    pub async fn get_status(&self, job_id: Uuid) -> Option<StatusSnapshot> {
        match self.read_snapshot(&Self::status_key(job_id)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Status cache read failed, treating as miss");
                None
            }
        }
    }

    /// Task handle of the delivery that last wrote the job's snapshot.
    pub async fn get_task_handle(&self, job_id: Uuid) -> Option<TaskHandle> {
        self.get_status(job_id).await.and_then(|s| s.task_id)
    }

    /// Snapshot as last written under a task handle.
    pub async fn get_by_task(&self, handle: &TaskHandle) -> Option<StatusSnapshot> {
        match self.read_snapshot(&Self::task_key(handle)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(task_id = %handle, error = %e, "Status cache read failed, treating as miss");
                None
            }
        }
    }

    /// Update progress and message of an existing snapshot.
    ///
    /// A missing snapshot is left missing: progress never creates a record.
    pub async fn update_progress(&self, job_id: Uuid, progress: u8, message: &str) {
        let Some(mut snapshot) = self.get_status(job_id).await else {
            tracing::debug!(job_id = %job_id, progress, "No snapshot to update, skipping progress");
            return;
        };
        if snapshot.status.is_terminal() {
            tracing::debug!(job_id = %job_id, progress, status = %snapshot.status, "Snapshot already terminal, skipping progress");
            return;
        }

        snapshot.metadata.progress = Some(progress.min(100));
        snapshot.metadata.message = Some(message.to_string());

        if let Err(e) = self.write_snapshot(job_id, &snapshot).await {
            tracing::warn!(job_id = %job_id, progress, error = %e, "Progress update skipped");
        }
    }

    /// Remove the job's snapshot and the entry under its real task handle.
    pub async fn delete_status(&self, job_id: Uuid) {
        let handle = self.get_task_handle(job_id).await;

        if let Err(e) = self.backend.del(&Self::status_key(job_id)).await {
            tracing::warn!(job_id = %job_id, error = %e, "Status cache delete skipped");
        }
        if let Some(handle) = handle {
            if let Err(e) = self.backend.del(&Self::task_key(&handle)).await {
                tracing::warn!(job_id = %job_id, task_id = %handle, error = %e, "Task cache delete skipped");
            }
        }
    }

    pub async fn health_check(&self) -> Result<(), CacheError> {
        self.backend.ping().await
    }

    async fn write_snapshot(&self, job_id: Uuid, snapshot: &StatusSnapshot) -> Result<(), CacheError> {
        let payload = serde_json::to_string(snapshot)?;
        self.backend
            .set_ex(&Self::status_key(job_id), &payload, self.ttl)
            .await?;
        if let Some(handle) = &snapshot.task_id {
            self.backend
                .set_ex(&Self::task_key(handle), &payload, self.ttl)
                .await?;
        }
        Ok(())
    }

    async fn read_snapshot(&self, key: &str) -> Result<Option<StatusSnapshot>, CacheError> {
        match self.backend.get(key).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with(ttl: Duration) -> (Arc<MemoryCache>, StatusCache) {
        let backend = Arc::new(MemoryCache::new());
        let cache = StatusCache::new(backend.clone(), ttl);
        (backend, cache)
    }

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let (_, cache) = cache_with(Duration::from_secs(3600));
        let job_id = Uuid::new_v4();
        let handle = TaskHandle::generate();
        let metadata = SnapshotMetadata::progress(30, "Converting");

        cache
            .set_status(job_id, JobStatus::Processing, Some(&handle), Some(metadata.clone()))
            .await;

        let snapshot = cache.get_status(job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Processing);
        assert_eq!(snapshot.task_id, Some(handle.clone()));
        assert_eq!(snapshot.metadata, metadata);
        assert_eq!(cache.get_by_task(&handle).await.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_set_status_is_idempotent() {
        let (_, cache) = cache_with(Duration::from_secs(3600));
        let job_id = Uuid::new_v4();
        for _ in 0..3 {
            cache.set_status(job_id, JobStatus::Uploaded, None, None).await;
        }
        let snapshot = cache.get_status(job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Uploaded);
        assert_eq!(snapshot.task_id, None);
        assert_eq!(snapshot.metadata, SnapshotMetadata::default());
    }

    #[tokio::test]
    async fn test_update_progress_without_snapshot_is_noop() {
        let (_, cache) = cache_with(Duration::from_secs(3600));
        let job_id = Uuid::new_v4();
        cache.update_progress(job_id, 50, "Converting").await;
        assert!(cache.get_status(job_id).await.is_none());
    }

    #[tokio::test]
    async fn test_update_progress_keeps_status_and_handle() {
        let (_, cache) = cache_with(Duration::from_secs(3600));
        let job_id = Uuid::new_v4();
        let handle = TaskHandle::generate();
        cache
            .set_status(job_id, JobStatus::Processing, Some(&handle), Some(SnapshotMetadata::progress(0, "Starting")))
            .await;

        cache.update_progress(job_id, 70, "Extracting metadata").await;

        let snapshot = cache.get_status(job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Processing);
        assert_eq!(snapshot.task_id, Some(handle));
        assert_eq!(snapshot.metadata.progress, Some(70));
        assert_eq!(snapshot.metadata.message.as_deref(), Some("Extracting metadata"));
    }

    #[tokio::test]
    async fn test_update_progress_leaves_terminal_snapshot_alone() {
        let (_, cache) = cache_with(Duration::from_secs(3600));
        let job_id = Uuid::new_v4();
        let handle = TaskHandle::generate();
        let done = SnapshotMetadata::progress(100, "Conversion complete").with_render_url("http://renders/x.glb");
        cache
            .set_status(job_id, JobStatus::Processed, Some(&handle), Some(done.clone()))
            .await;

        // A straggling delivery reports an earlier checkpoint
        cache.update_progress(job_id, 30, "Converting to GLB").await;

        let snapshot = cache.get_status(job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Processed);
        assert_eq!(snapshot.metadata, done);
    }

    #[tokio::test]
    async fn test_delete_removes_both_keys() {
        let (backend, cache) = cache_with(Duration::from_secs(3600));
        let job_id = Uuid::new_v4();
        let handle = TaskHandle::generate();
        cache
            .set_status(job_id, JobStatus::Processing, Some(&handle), None)
            .await;
        assert!(backend.contains(&StatusCache::task_key(&handle)));

        cache.delete_status(job_id).await;

        assert!(cache.get_status(job_id).await.is_none());
        assert!(!backend.contains(&StatusCache::task_key(&handle)));
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let (_, cache) = cache_with(Duration::from_millis(20));
        let job_id = Uuid::new_v4();
        cache.set_status(job_id, JobStatus::Uploaded, None, None).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get_status(job_id).await.is_none());
    }

    #[tokio::test]
    async fn test_outage_degrades_to_miss() {
        let (backend, cache) = cache_with(Duration::from_secs(3600));
        let job_id = Uuid::new_v4();
        backend.set_offline(true);

        cache.set_status(job_id, JobStatus::Uploaded, None, None).await;
        cache.update_progress(job_id, 10, "Downloading").await;
        cache.delete_status(job_id).await;
        assert!(cache.get_status(job_id).await.is_none());
        assert!(cache.health_check().await.is_err());
    }
}
