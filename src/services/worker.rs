//! Worker execution loop: drives one delivered job from dequeue to a terminal state.
//!
//! Per delivery:
//! 1. commit PROCESSING durably, then write a PROCESSING snapshot (progress 0)
//!    tagged with the task handle;
//! 2. download, convert, extract metadata, upload, reporting fixed checkpoints;
//! 3. commit PROCESSED or FAILED durably, then mirror it into the cache;
//! 4. acknowledge the delivery with the task's outcome.
//!
//! A delivery that finds the job settled by someone else rewrites the cache
//! from the durable record instead of leaving its own snapshot behind.
//!
//! Overrunning the hard time limit abandons the conversion and settles the
//! delivery as failed, leaving redelivery to the queue.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::JobError;
use crate::models::job::{ConversionJob, JobStatus};
use crate::models::metadata::{ConversionOutput, MeshMetadata};
use crate::models::snapshot::SnapshotMetadata;
use crate::models::task::{TaskHandle, TaskState};
use crate::services::converter::{ConversionEngine, Deflection};
use crate::services::jobs::{input_key, output_key};
use crate::services::metadata::MetadataExtractor;
use crate::services::queue::{Delivery, DispatchPolicy, QueueError, RejectOutcome};

const GLB_CONTENT_TYPE: &str = "model/gltf-binary";

/// A coarse progress point reported while a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub progress: u8,
    pub message: &'static str,
}

pub const STARTED: Checkpoint = Checkpoint { progress: 0, message: "Starting conversion" };
pub const DOWNLOADING: Checkpoint = Checkpoint { progress: 10, message: "Downloading input" };
pub const CONVERTING: Checkpoint = Checkpoint { progress: 30, message: "Converting to GLB" };
pub const EXTRACTING: Checkpoint = Checkpoint { progress: 70, message: "Extracting metadata" };
pub const UPLOADING: Checkpoint = Checkpoint { progress: 85, message: "Uploading result" };
pub const COMPLETE: Checkpoint = Checkpoint { progress: 100, message: "Conversion complete" };

/// How a delivery ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Processed(ConversionOutput),
    /// Acknowledged without work (duplicate, terminal, or missing job).
    Skipped(String),
}

impl DeliveryOutcome {
    /// Whether this delivery spent a slot of the worker's recycle bound.
    ///
    /// Only deliveries that ran the pipeline count; acknowledged duplicates do not.
    pub fn counts_toward_recycle(result: &Result<DeliveryOutcome, JobError>) -> bool {
        !matches!(result, Ok(DeliveryOutcome::Skipped(_)))
    }
}

pub struct Worker {
    state: AppState,
    engine: Arc<dyn ConversionEngine>,
    extractor: Arc<dyn MetadataExtractor>,
    policy: DispatchPolicy,
    deflection: Deflection,
}

impl Worker {
    pub fn new(
        state: AppState,
        engine: Arc<dyn ConversionEngine>,
        extractor: Arc<dyn MetadataExtractor>,
        policy: DispatchPolicy,
        deflection: Deflection,
    ) -> Self {
        Self {
            state,
            engine,
            extractor,
            policy,
            deflection,
        }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Take and run one delivery. Returns `Ok(None)` when the queue is empty.
    pub async fn poll_once(&self) -> Result<Option<DeliveryOutcome>, JobError> {
        match self.state.queue.dequeue().await? {
            Some(delivery) => self.run_delivery(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run one delivery to completion, failure, or the hard deadline.
    pub async fn run_delivery(&self, delivery: Delivery) -> Result<DeliveryOutcome, JobError> {
        let job_id = delivery.job_id();
        let handle = delivery.task_id().clone();

        tracing::info!(
            job_id = %job_id,
            task_id = %handle,
            attempt = delivery.attempt(),
            "Processing conversion job"
        );

        let job = match self.state.jobs.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job_id = %job_id, task_id = %handle, "Job no longer exists, dropping delivery");
                self.ack(&delivery, TaskState::failed(JobError::NotFound(job_id).to_string()))
                    .await;
                return Ok(DeliveryOutcome::Skipped("job not found".to_string()));
            }
            Err(e) => return self.fail(&delivery, e.into()).await,
        };

        if job.status.is_terminal() {
            tracing::info!(
                job_id = %job_id,
                task_id = %handle,
                status = %job.status,
                "Job already terminal, acknowledging duplicate delivery"
            );
            self.ack(&delivery, terminal_state(&job)).await;
            return Ok(DeliveryOutcome::Skipped(format!("job already {}", job.status)));
        }

        match self.state.jobs.mark_processing(job_id).await {
            Ok(true) => {}
            Ok(false) => {
                let reason = format!("job is {}, not ready for processing", job.status);
                tracing::warn!(job_id = %job_id, task_id = %handle, reason = %reason, "Skipping delivery");
                self.ack(&delivery, TaskState::failed(reason.clone())).await;
                return Ok(DeliveryOutcome::Skipped(reason));
            }
            Err(e) => return self.fail(&delivery, e.into()).await,
        }
        self.state
            .cache
            .set_status(
                job_id,
                JobStatus::Processing,
                Some(&handle),
                Some(SnapshotMetadata::progress(STARTED.progress, STARTED.message)),
            )
            .await;

        // A concurrent delivery may have settled the job before our snapshot landed
        if let Some(settled) = self.resync_settled(job_id, &handle).await {
            tracing::info!(
                job_id = %job_id,
                task_id = %handle,
                status = %settled.status,
                "Job settled by another delivery, skipping conversion"
            );
            self.ack(&delivery, terminal_state(&settled)).await;
            return Ok(DeliveryOutcome::Skipped(format!("job already {}", settled.status)));
        }

        let started = Instant::now();
        let heartbeat = self.spawn_heartbeat(delivery.clone());
        let soft_warning = self.spawn_soft_deadline_warning(job_id, handle.clone());

        let result = tokio::time::timeout(self.policy.hard_time_limit(), self.convert(job_id)).await;

        heartbeat.abort();
        soft_warning.abort();
        metrics::histogram!("conversion_processing_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(Ok(output)) => self.complete(&delivery, output).await,
            Ok(Err(e)) => self.fail(&delivery, e).await,
            Err(_) => self.deadline_exceeded(&delivery).await,
        }
    }

    /// Settle deliveries whose worker died; dead-lettered jobs are marked failed.
    pub async fn reap_lost_deliveries(&self) -> Result<usize, JobError> {
        let settled = self.state.queue.reap_expired().await?;
        for (task, outcome) in &settled {
            match outcome {
                RejectOutcome::Redelivered { attempt } => {
                    metrics::counter!("conversion_deliveries_redelivered").increment(1);
                    tracing::warn!(
                        job_id = %task.job_id,
                        task_id = %task.task_id,
                        attempt,
                        "Delivery lease lapsed, task redelivered"
                    );
                }
                RejectOutcome::DeadLettered => {
                    self.record_dead_letter(task.job_id, &task.task_id, "worker lost")
                        .await;
                }
                RejectOutcome::AlreadySettled => {}
            }
        }
        Ok(settled.len())
    }

    /// The conversion pipeline. Staging files are removed when this returns or is dropped.
    async fn convert(&self, job_id: Uuid) -> Result<ConversionOutput, JobError> {
        let staging = tempfile::Builder::new()
            .prefix("step-render-")
            .tempdir()?;
        let input_path = staging.path().join(format!("{job_id}.step"));
        let output_path = staging.path().join(format!("{job_id}.glb"));

        self.checkpoint(job_id, DOWNLOADING).await;
        self.state
            .inputs
            .download_to_file(&input_key(job_id), &input_path)
            .await?;

        self.checkpoint(job_id, CONVERTING).await;
        tracing::debug!(
            job_id = %job_id,
            linear = self.deflection.linear,
            angular = self.deflection.angular,
            "Invoking conversion engine"
        );
        self.engine
            .convert(&input_path, &output_path, self.deflection)
            .await?;

        self.checkpoint(job_id, EXTRACTING).await;
        let extractor = self.extractor.clone();
        let mesh_path = output_path.clone();
        let metadata = tokio::task::spawn_blocking(move || extractor.extract(&mesh_path))
            .await
            .unwrap_or_else(|e| MeshMetadata::degraded(format!("metadata extraction aborted: {e}")));
        if let Some(reason) = &metadata.error {
            let degraded = JobError::MetadataExtractionDegraded(reason.clone());
            metrics::counter!("conversion_metadata_degraded").increment(1);
            tracing::warn!(job_id = %job_id, error = %degraded, "Continuing with placeholder metadata");
        }

        self.checkpoint(job_id, UPLOADING).await;
        let key = output_key(job_id);
        self.state
            .outputs
            .upload_from_file(&key, &output_path, GLB_CONTENT_TYPE)
            .await?;

        Ok(ConversionOutput {
            render_url: self.state.outputs.object_url(&key),
            metadata,
        })
    }

    async fn checkpoint(&self, job_id: Uuid, checkpoint: Checkpoint) {
        tracing::debug!(job_id = %job_id, progress = checkpoint.progress, "{}", checkpoint.message);
        self.state
            .cache
            .update_progress(job_id, checkpoint.progress, checkpoint.message)
            .await;
    }

    async fn complete(
        &self,
        delivery: &Delivery,
        output: ConversionOutput,
    ) -> Result<DeliveryOutcome, JobError> {
        let job_id = delivery.job_id();
        let handle = delivery.task_id();
        let metadata = serde_json::to_value(&output.metadata).unwrap_or(serde_json::Value::Null);

        let committed = match self
            .state
            .jobs
            .mark_processed(job_id, &output.render_url, &metadata, Utc::now())
            .await
        {
            Ok(committed) => committed,
            Err(e) => return self.fail(delivery, e.into()).await,
        };

        if !committed {
            tracing::warn!(
                job_id = %job_id,
                task_id = %handle,
                "Job left processing before this delivery finished, result not committed"
            );
            let outcome = match self.resync_settled(job_id, handle).await {
                Some(settled) => terminal_state(&settled),
                None => TaskState::failed("superseded by another delivery"),
            };
            self.ack(delivery, outcome).await;
            return Ok(DeliveryOutcome::Skipped("superseded by another delivery".to_string()));
        }

        let result = serde_json::to_value(&output).unwrap_or(serde_json::Value::Null);
        self.ack(delivery, TaskState::succeeded(result)).await;

        self.state
            .cache
            .set_status(
                job_id,
                JobStatus::Processed,
                Some(handle),
                Some(
                    SnapshotMetadata::progress(COMPLETE.progress, COMPLETE.message)
                        .with_render_url(&output.render_url),
                ),
            )
            .await;

        metrics::counter!("conversion_jobs_completed").increment(1);
        tracing::info!(
            job_id = %job_id,
            task_id = %handle,
            nodes = output.metadata.node_count,
            meshes = output.metadata.mesh_count,
            materials = output.metadata.material_count,
            "Conversion job completed"
        );

        Ok(DeliveryOutcome::Processed(output))
    }

    /// Commit FAILED in both stores, acknowledge, and hand the error back.
    async fn fail(&self, delivery: &Delivery, error: JobError) -> Result<DeliveryOutcome, JobError> {
        let job_id = delivery.job_id();
        let handle = delivery.task_id();
        let message = error.to_string();

        tracing::error!(job_id = %job_id, task_id = %handle, error = %message, "Conversion job failed");
        let outcome = match self.commit_failure(job_id, handle, &message).await {
            Some(settled) => terminal_state(&settled),
            None => TaskState::failed(message),
        };
        self.ack(delivery, outcome).await;

        Err(error)
    }

    async fn deadline_exceeded(&self, delivery: &Delivery) -> Result<DeliveryOutcome, JobError> {
        let job_id = delivery.job_id();
        let handle = delivery.task_id();
        let limit = self.policy.hard_time_limit().as_secs_f64();
        let reason = format!("hard time limit of {limit}s exceeded");

        tracing::error!(job_id = %job_id, task_id = %handle, "Conversion terminated: {reason}");

        match self.state.queue.reject(delivery, &reason).await {
            Ok(RejectOutcome::Redelivered { attempt }) => {
                metrics::counter!("conversion_deliveries_redelivered").increment(1);
                tracing::info!(job_id = %job_id, task_id = %handle, attempt, "Task redelivered");
            }
            Ok(RejectOutcome::DeadLettered) => {
                self.record_dead_letter(job_id, handle, &reason).await;
            }
            Ok(RejectOutcome::AlreadySettled) => {}
            Err(e) => {
                tracing::error!(job_id = %job_id, task_id = %handle, error = %e, "Failed to settle delivery");
            }
        }

        Err(JobError::TaskDelivery(reason))
    }

    async fn record_dead_letter(&self, job_id: Uuid, handle: &TaskHandle, reason: &str) {
        metrics::counter!("conversion_deliveries_dead_lettered").increment(1);
        let message = format!("Delivery attempts exhausted: {reason}");
        tracing::error!(job_id = %job_id, task_id = %handle, "{message}");
        self.commit_failure(job_id, handle, &message).await;
    }

    /// Commit FAILED durably and in the cache.
    ///
    /// Returns the settled record when another party had already finished the job.
    async fn commit_failure(
        &self,
        job_id: Uuid,
        handle: &TaskHandle,
        message: &str,
    ) -> Option<ConversionJob> {
        match self.state.jobs.mark_failed(job_id, message, Utc::now()).await {
            Ok(true) => {
                self.state
                    .cache
                    .set_status(
                        job_id,
                        JobStatus::Failed,
                        Some(handle),
                        Some(SnapshotMetadata::default().with_error(message)),
                    )
                    .await;
                metrics::counter!("conversion_jobs_failed").increment(1);
                None
            }
            Ok(false) => {
                tracing::warn!(job_id = %job_id, task_id = %handle, "Job already settled, failure not recorded");
                self.resync_settled(job_id, handle).await
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, task_id = %handle, error = %e, "Failed to record job failure");
                None
            }
        }
    }

    /// If the durable record is terminal, make the cache snapshot agree with it.
    ///
    /// Returns the terminal record, or `None` while the job is still open.
    async fn resync_settled(&self, job_id: Uuid, handle: &TaskHandle) -> Option<ConversionJob> {
        let job = match self.state.jobs.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.state.cache.delete_status(job_id).await;
                return None;
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, task_id = %handle, error = %e, "Could not re-read job record");
                return None;
            }
        };

        let metadata = match job.status {
            JobStatus::Processed => {
                let metadata = SnapshotMetadata::progress(COMPLETE.progress, COMPLETE.message);
                match &job.output_url {
                    Some(url) => metadata.with_render_url(url),
                    None => metadata,
                }
            }
            JobStatus::Failed => {
                SnapshotMetadata::default().with_error(job.error.as_deref().unwrap_or("job failed"))
            }
            _ => return None,
        };

        let current = self.state.cache.get_status(job_id).await;
        if current.as_ref().map(|s| s.status) != Some(job.status) {
            tracing::info!(job_id = %job_id, task_id = %handle, status = %job.status, "Restoring settled status snapshot");
            self.state
                .cache
                .set_status(job_id, job.status, Some(handle), Some(metadata))
                .await;
        }
        Some(job)
    }

    async fn ack(&self, delivery: &Delivery, outcome: TaskState) {
        if let Err(e) = self.state.queue.ack(delivery, outcome).await {
            tracing::error!(
                job_id = %delivery.job_id(),
                task_id = %delivery.task_id(),
                error = %e,
                "Failed to acknowledge delivery"
            );
        }
    }

    fn spawn_heartbeat(&self, delivery: Delivery) -> JoinHandle<()> {
        let queue = self.state.queue.clone();
        let interval = self.policy.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match queue.heartbeat(&delivery).await {
                    Ok(()) => {}
                    Err(QueueError::LeaseLost(handle)) => {
                        tracing::warn!(task_id = %handle, "Delivery lease lost while running");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %delivery.task_id(), error = %e, "Heartbeat failed");
                    }
                }
            }
        })
    }

    fn spawn_soft_deadline_warning(&self, job_id: Uuid, handle: TaskHandle) -> JoinHandle<()> {
        let soft_limit = self.policy.soft_time_limit();
        tokio::spawn(async move {
            tokio::time::sleep(soft_limit).await;
            tracing::warn!(
                job_id = %job_id,
                task_id = %handle,
                soft_limit_secs = soft_limit.as_secs_f64(),
                "Conversion exceeded soft time limit"
            );
        })
    }
}

/// Task outcome reported for a duplicate delivery of an already settled job.
fn terminal_state(job: &ConversionJob) -> TaskState {
    match job.status {
        JobStatus::Processed => {
            let metadata = job
                .metadata
                .clone()
                .and_then(|m| serde_json::from_value::<MeshMetadata>(m).ok())
                .unwrap_or_default();
            match &job.output_url {
                Some(render_url) => serde_json::to_value(ConversionOutput {
                    render_url: render_url.clone(),
                    metadata,
                })
                .map(TaskState::succeeded)
                .unwrap_or_else(|e| TaskState::failed(e.to_string())),
                None => TaskState::failed("processed job has no output"),
            }
        }
        _ => TaskState::failed(job.error.clone().unwrap_or_else(|| "job failed".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::MemoryBackends;
    use crate::db::store::JobStore;
    use crate::models::task::TaskStateKind;
    use crate::services::cache::StatusCache;
    use crate::services::converter::ConversionError;
    use crate::services::jobs;
    use crate::services::metadata::GlbMetadataExtractor;
    use crate::services::queue::TaskQueue;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;

    const SCENE: &str = r#"{"nodes":[{"name":"bracket","mesh":0}],"meshes":[{}],"materials":[{}]}"#;
    const WINNER_URL: &str = "http://renders/winner.glb";

    /// Writes a fixed output file, recording what it saw.
    struct ScriptedEngine {
        output: Result<Vec<u8>, String>,
        delay: Duration,
        seen_input: Mutex<Option<PathBuf>>,
        observer: Option<(StatusCache, Uuid)>,
        observed_progress: Mutex<Option<u8>>,
        /// Another delivery that commits PROCESSED while this one converts.
        racer: Option<(Arc<dyn JobStore>, Uuid)>,
    }

    impl ScriptedEngine {
        fn writing(bytes: &[u8]) -> Self {
            Self {
                output: Ok(bytes.to_vec()),
                delay: Duration::ZERO,
                seen_input: Mutex::new(None),
                observer: None,
                observed_progress: Mutex::new(None),
                racer: None,
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                output: Err(message.to_string()),
                ..Self::writing(b"")
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::writing(SCENE.as_bytes())
            }
        }
    }

    #[async_trait]
    impl ConversionEngine for ScriptedEngine {
        async fn convert(
            &self,
            input: &Path,
            output: &Path,
            _deflection: Deflection,
        ) -> Result<(), ConversionError> {
            *self.seen_input.lock().unwrap() = Some(input.to_path_buf());
            assert!(input.exists(), "input should be staged before conversion");
            if let Some((cache, job_id)) = &self.observer {
                let snapshot = cache.get_status(*job_id).await;
                *self.observed_progress.lock().unwrap() = snapshot.and_then(|s| s.metadata.progress);
            }
            if let Some((jobs, job_id)) = &self.racer {
                let metadata = serde_json::json!({"node_count": 0, "meshes_count": 0, "materials_count": 0, "nodes": []});
                assert!(jobs
                    .mark_processed(*job_id, WINNER_URL, &metadata, Utc::now())
                    .await
                    .unwrap());
            }
            tokio::time::sleep(self.delay).await;
            match &self.output {
                Ok(bytes) => {
                    tokio::fs::write(output, bytes).await.unwrap();
                    Ok(())
                }
                Err(message) => Err(ConversionError::Engine(message.clone())),
            }
        }
    }

    fn fast_policy() -> DispatchPolicy {
        DispatchPolicy::new(
            Duration::from_millis(200),
            Duration::from_millis(100),
            50,
            Duration::from_secs(3600),
            Duration::from_millis(150),
            2,
        )
        .unwrap()
    }

    async fn uploaded_job(backends: &MemoryBackends) -> Uuid {
        let state = backends.state();
        let upload = jobs::create_job(&state, "bracket.step", Some(13)).await.unwrap();
        backends
            .inputs
            .put(&jobs::input_key(upload.object_uuid), b"ISO-10303-21;".to_vec());
        jobs::confirm_upload(&state, upload.object_uuid).await.unwrap();
        upload.object_uuid
    }

    fn worker(backends: &MemoryBackends, engine: Arc<ScriptedEngine>) -> Worker {
        Worker::new(
            backends.state(),
            engine,
            Arc::new(GlbMetadataExtractor),
            fast_policy(),
            Deflection::default(),
        )
    }

    #[tokio::test]
    async fn test_successful_delivery_commits_processed() {
        let backends = MemoryBackends::new(fast_policy());
        let job_id = uploaded_job(&backends).await;
        let engine = Arc::new(ScriptedEngine::writing(SCENE.as_bytes()));
        let worker = worker(&backends, engine.clone());

        let outcome = worker.poll_once().await.unwrap().unwrap();
        let DeliveryOutcome::Processed(output) = outcome else {
            panic!("expected processed outcome");
        };
        assert_eq!(output.metadata.node_count, 1);

        let job = backends.jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processed);
        assert_eq!(job.output_url.as_deref(), Some(output.render_url.as_str()));
        assert_eq!(job.metadata.unwrap()["nodes"][0]["name"], "bracket");
        assert!(job.processed_at.is_some());
        assert!(backends.outputs.contains(&jobs::output_key(job_id)));

        let snapshot = backends.state().cache.get_status(job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Processed);
        assert_eq!(snapshot.metadata.progress, Some(100));
        let handle = snapshot.task_id.unwrap();
        let live = backends.queue.task_state(&handle).await.unwrap().unwrap();
        assert_eq!(live.state, TaskStateKind::Success);
        assert_eq!(backends.queue.in_flight(), 0);

        let staged = engine.seen_input.lock().unwrap().clone().unwrap();
        assert!(!staged.exists(), "staging files should be removed");
    }

    #[tokio::test]
    async fn test_processing_is_visible_before_conversion() {
        let backends = MemoryBackends::new(fast_policy());
        let job_id = uploaded_job(&backends).await;
        let engine = Arc::new(ScriptedEngine {
            observer: Some((backends.state().cache.clone(), job_id)),
            ..ScriptedEngine::writing(SCENE.as_bytes())
        });
        let worker = worker(&backends, engine.clone());

        worker.poll_once().await.unwrap();
        assert_eq!(*engine.observed_progress.lock().unwrap(), Some(CONVERTING.progress));
    }

    #[tokio::test]
    async fn test_engine_failure_commits_failed_everywhere() {
        let backends = MemoryBackends::new(fast_policy());
        let job_id = uploaded_job(&backends).await;
        let engine = Arc::new(ScriptedEngine::failing("BRep has no solids"));
        let worker = worker(&backends, engine.clone());

        let result = worker.poll_once().await;
        assert!(matches!(result, Err(JobError::ConversionFailure(_))));

        let job = backends.jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.unwrap();
        assert!(error.contains("BRep has no solids"));

        let snapshot = backends.state().cache.get_status(job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.metadata.error.as_deref(), Some(error.as_str()));

        let live = backends
            .queue
            .task_state(&snapshot.task_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live.state, TaskStateKind::Failure);
        assert_eq!(backends.queue.depth().await.unwrap(), 0);

        let staged = engine.seen_input.lock().unwrap().clone().unwrap();
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_missing_input_blob_is_storage_failure() {
        let backends = MemoryBackends::new(fast_policy());
        let state = backends.state();
        let upload = jobs::create_job(&state, "bracket.step", None).await.unwrap();
        jobs::confirm_upload(&state, upload.object_uuid).await.unwrap();
        let worker = worker(&backends, Arc::new(ScriptedEngine::writing(SCENE.as_bytes())));

        let result = worker.poll_once().await;
        assert!(matches!(result, Err(JobError::UpstreamStorage(_))));
        let job = backends.jobs.get(upload.object_uuid).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_degraded_metadata_still_succeeds() {
        let backends = MemoryBackends::new(fast_policy());
        let job_id = uploaded_job(&backends).await;
        let worker = worker(&backends, Arc::new(ScriptedEngine::writing(b"garbage")));

        let outcome = worker.poll_once().await.unwrap().unwrap();
        let DeliveryOutcome::Processed(output) = outcome else {
            panic!("expected processed outcome");
        };
        assert!(output.metadata.is_degraded());
        assert!(output.metadata.nodes.is_empty());

        let job = backends.jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processed);
        assert!(job.metadata.unwrap()["error"].is_string());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_of_terminal_job_is_skipped() {
        let backends = MemoryBackends::new(fast_policy());
        let job_id = uploaded_job(&backends).await;
        let state = backends.state();
        let worker = worker(&backends, Arc::new(ScriptedEngine::writing(SCENE.as_bytes())));
        worker.poll_once().await.unwrap();
        let before = backends.jobs.get(job_id).await.unwrap().unwrap();

        // A redelivery of the same job arriving after it finished
        state.queue.enqueue(job_id).await.unwrap();
        let outcome = worker.poll_once().await.unwrap().unwrap();

        assert!(matches!(outcome, DeliveryOutcome::Skipped(_)));
        assert_eq!(backends.jobs.get(job_id).await.unwrap().unwrap(), before);
        assert_eq!(
            state.cache.get_status(job_id).await.unwrap().status,
            JobStatus::Processed
        );
    }

    #[tokio::test]
    async fn test_superseded_result_restores_winner_snapshot() {
        let backends = MemoryBackends::new(fast_policy());
        let job_id = uploaded_job(&backends).await;
        let state = backends.state();
        let engine = Arc::new(ScriptedEngine {
            racer: Some((state.jobs.clone(), job_id)),
            ..ScriptedEngine::writing(SCENE.as_bytes())
        });
        let worker = worker(&backends, engine);

        let outcome = worker.poll_once().await.unwrap().unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Skipped(_)));

        let snapshot = state.cache.get_status(job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Processed);
        assert_eq!(snapshot.metadata.progress, Some(COMPLETE.progress));
        assert_eq!(snapshot.metadata.render_url.as_deref(), Some(WINNER_URL));

        let live = backends
            .queue
            .task_state(&snapshot.task_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live.state, TaskStateKind::Success);
        assert_eq!(live.result.unwrap()["render_url"], WINNER_URL);
    }

    #[tokio::test]
    async fn test_late_failure_keeps_processed_snapshot() {
        let backends = MemoryBackends::new(fast_policy());
        let job_id = uploaded_job(&backends).await;
        let state = backends.state();
        let engine = Arc::new(ScriptedEngine {
            racer: Some((state.jobs.clone(), job_id)),
            ..ScriptedEngine::failing("late duplicate")
        });
        let worker = worker(&backends, engine);

        assert!(worker.poll_once().await.is_err());

        let job = backends.jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processed);
        assert!(job.error.is_none());

        let snapshot = state.cache.get_status(job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Processed);
        assert!(snapshot.metadata.error.is_none());
        let live = backends
            .queue
            .task_state(&snapshot.task_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live.state, TaskStateKind::Success);

        let response = crate::services::status::resolve_status(&state, job_id).await.unwrap();
        assert_eq!(response.status, JobStatus::Processed);
        assert!(response.error.is_none());
        assert_eq!(response.render_url.as_deref(), Some(WINNER_URL));
    }

    #[tokio::test]
    async fn test_unconfirmed_job_is_not_processed() {
        let backends = MemoryBackends::new(fast_policy());
        let state = backends.state();
        let upload = jobs::create_job(&state, "bracket.step", None).await.unwrap();
        state.queue.enqueue(upload.object_uuid).await.unwrap();
        let worker = worker(&backends, Arc::new(ScriptedEngine::writing(SCENE.as_bytes())));

        let outcome = worker.poll_once().await.unwrap().unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Skipped(_)));
        let job = backends.jobs.get(upload.object_uuid).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Uploading);
    }

    #[tokio::test]
    async fn test_hard_deadline_redelivers_then_dead_letters() {
        let backends = MemoryBackends::new(fast_policy());
        let job_id = uploaded_job(&backends).await;
        let worker = worker(&backends, Arc::new(ScriptedEngine::slow(Duration::from_secs(5))));

        let first = worker.poll_once().await;
        assert!(matches!(first, Err(JobError::TaskDelivery(_))));
        let job = backends.jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(backends.queue.depth().await.unwrap(), 1);

        let second = worker.poll_once().await;
        assert!(matches!(second, Err(JobError::TaskDelivery(_))));
        assert_eq!(backends.queue.depth().await.unwrap(), 0);
        assert_eq!(backends.queue.dead_letters().len(), 1);

        let job = backends.jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("Delivery attempts exhausted"));
    }

    #[tokio::test]
    async fn test_skipped_deliveries_do_not_count_toward_recycle() {
        let backends = MemoryBackends::new(fast_policy());
        let job_id = uploaded_job(&backends).await;
        let worker = worker(&backends, Arc::new(ScriptedEngine::writing(SCENE.as_bytes())));

        let processed = worker.poll_once().await.map(Option::unwrap);
        assert!(DeliveryOutcome::counts_toward_recycle(&processed));

        backends.queue.enqueue(job_id).await.unwrap();
        let duplicate = worker.poll_once().await.map(Option::unwrap);
        assert!(matches!(duplicate, Ok(DeliveryOutcome::Skipped(_))));
        assert!(!DeliveryOutcome::counts_toward_recycle(&duplicate));

        let failed: Result<DeliveryOutcome, JobError> =
            Err(JobError::TaskDelivery("hard time limit exceeded".to_string()));
        assert!(DeliveryOutcome::counts_toward_recycle(&failed));
    }

    #[tokio::test]
    async fn test_cache_outage_does_not_fail_job() {
        let backends = MemoryBackends::new(fast_policy());
        let job_id = uploaded_job(&backends).await;
        backends.cache.set_offline(true);
        let worker = worker(&backends, Arc::new(ScriptedEngine::writing(SCENE.as_bytes())));

        let outcome = worker.poll_once().await.unwrap().unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Processed(_)));
        let job = backends.jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processed);
    }

    #[tokio::test]
    async fn test_reaper_dead_letters_lost_delivery() {
        let backends = MemoryBackends::new(fast_policy());
        let job_id = uploaded_job(&backends).await;
        let worker = worker(&backends, Arc::new(ScriptedEngine::writing(SCENE.as_bytes())));

        // Two deliveries taken by workers that died without acknowledging
        for _ in 0..2 {
            let delivery = backends.queue.dequeue().await.unwrap().unwrap();
            backends.jobs.mark_processing(delivery.job_id()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(worker.reap_lost_deliveries().await.unwrap(), 1);
        }

        let job = backends.jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(worker.poll_once().await.unwrap().is_none());
    }
}
