use chrono::Utc;
use std::time::Duration;
use uuid::Uuid;

use step_render::{
    app_state::AppState,
    config::AppConfig,
    db,
    models::{job::ConversionJob, job::JobStatus, snapshot::SnapshotMetadata, task::TaskStateKind},
    services::{jobs, status},
};

/// Context against the real Postgres, Redis and S3-compatible storage from the environment.
async fn connect() -> AppState {
    let config = AppConfig::from_env().expect("Failed to load config");
    let policy = config.dispatch_policy().expect("Invalid dispatch policy");

    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let state = AppState::connect(&config, db_pool, policy).expect("Failed to build context");
    state.ensure_buckets().await.expect("Failed to prepare buckets");
    state
}

/// Integration test: durable transitions, status cache and task queue.
///
/// Note: This requires running PostgreSQL, Redis and MinIO instances
/// configured via environment variables.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_full_integration() {
    let state = connect().await;

    // 1. Durable store: conditional transitions
    let job = ConversionJob::new("integration.step", Some(13));
    state.jobs.create(&job).await.expect("Failed to create job");

    assert!(!state.jobs.mark_processing(job.id).await.expect("query failed"));
    let input_url = state.inputs.object_url(&jobs::input_key(job.id));
    assert!(state
        .jobs
        .mark_uploaded(job.id, &input_url, Utc::now())
        .await
        .expect("query failed"));
    assert!(state.jobs.mark_processing(job.id).await.expect("query failed"));
    assert!(state.jobs.mark_processing(job.id).await.expect("re-entry failed"));

    let metadata = serde_json::json!({"node_count": 0, "meshes_count": 0, "materials_count": 0, "nodes": []});
    assert!(state
        .jobs
        .mark_processed(job.id, "http://localhost/renders/x.glb", &metadata, Utc::now())
        .await
        .expect("query failed"));
    assert!(!state
        .jobs
        .mark_failed(job.id, "too late", Utc::now())
        .await
        .expect("query failed"));

    let stored = state
        .jobs
        .get(job.id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(stored.status, JobStatus::Processed);
    assert_eq!(stored.metadata, Some(metadata));
    assert!(stored.error.is_none());

    // 2. Status cache
    let handle = state.queue.enqueue(job.id).await.expect("Failed to enqueue");
    state
        .cache
        .set_status(
            job.id,
            JobStatus::Processing,
            Some(&handle),
            Some(SnapshotMetadata::progress(30, "Converting to GLB")),
        )
        .await;
    let snapshot = state.cache.get_status(job.id).await.expect("snapshot missing");
    assert_eq!(snapshot.metadata.progress, Some(30));
    assert_eq!(state.cache.get_by_task(&handle).await, Some(snapshot));

    // 3. Queue and result backend
    let delivery = state
        .queue
        .dequeue()
        .await
        .expect("Failed to dequeue")
        .expect("No task in queue");
    assert_eq!(delivery.job_id(), job.id);
    state.queue.heartbeat(&delivery).await.expect("Heartbeat failed");
    let live = state
        .queue
        .task_state(&handle)
        .await
        .expect("Result backend failed")
        .expect("No task state");
    assert_eq!(live.state, TaskStateKind::Started);

    let response = status::resolve_status(&state, job.id).await.expect("resolve failed");
    assert_eq!(response.live_state, Some(TaskStateKind::Started));

    // Cleanup
    state
        .queue
        .ack(&delivery, step_render::models::task::TaskState::failed("integration cleanup"))
        .await
        .expect("Failed to ack");
    state.cache.delete_status(job.id).await;
    state.jobs.delete(job.id).await.expect("Failed to delete job");
    assert!(state.cache.get_by_task(&handle).await.is_none());
}

#[tokio::test]
#[ignore]
async fn test_blob_round_trip() {
    let state = connect().await;
    let job_id = Uuid::new_v4();
    let staging = tempfile::tempdir().expect("tempdir");
    let source = staging.path().join("source.glb");
    let fetched = staging.path().join("fetched.glb");
    tokio::fs::write(&source, b"glTF test payload").await.expect("write");

    let key = jobs::output_key(job_id);
    state
        .outputs
        .upload_from_file(&key, &source, "model/gltf-binary")
        .await
        .expect("Upload failed");
    state
        .outputs
        .download_to_file(&key, &fetched)
        .await
        .expect("Download failed");
    assert_eq!(
        tokio::fs::read(&fetched).await.expect("read"),
        b"glTF test payload".to_vec()
    );

    let url = state
        .outputs
        .presigned_download_url(&key, 60)
        .await
        .expect("Presign failed");
    assert!(url.contains(&key));

    state.outputs.delete(&key).await.expect("Delete failed");
    // Deleting a missing object is tolerated
    state.outputs.delete(&key).await.expect("Second delete failed");
}

#[tokio::test]
#[ignore]
async fn test_lapsed_lease_is_reaped() {
    let state = connect().await;
    let job_id = Uuid::new_v4();
    let handle = state.queue.enqueue(job_id).await.expect("Failed to enqueue");
    let delivery = state
        .queue
        .dequeue()
        .await
        .expect("Failed to dequeue")
        .expect("No task in queue");
    assert_eq!(delivery.task_id(), &handle);

    // Wait out the configured lease without heartbeating
    let config = AppConfig::from_env().expect("Failed to load config");
    tokio::time::sleep(Duration::from_secs(config.delivery_lease_secs + 1)).await;

    let reaped = state.queue.reap_expired().await.expect("Reap failed");
    assert!(reaped.iter().any(|(task, _)| task.task_id == handle));
}
