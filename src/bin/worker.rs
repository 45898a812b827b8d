use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use step_render::{
    app_state::AppState,
    config::AppConfig,
    db,
    services::{
        converter::CommandEngine,
        metadata::GlbMetadataExtractor,
        worker::{DeliveryOutcome, Worker},
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting conversion worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let policy = config
        .dispatch_policy()
        .expect("Invalid task dispatch configuration");
    let deflection = config.deflection().expect("Invalid mesh deflection");
    let poll_interval = config.poll_interval();

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("Invalid WORKER_METRICS_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    let state = AppState::connect(&config, db_pool, policy.clone())
        .expect("Failed to initialize service clients");

    let worker = Worker::new(
        state.clone(),
        Arc::new(CommandEngine::new(config.converter_command.clone())),
        Arc::new(GlbMetadataExtractor),
        policy,
        deflection,
    );

    tracing::info!(
        converter = %config.converter_command,
        hard_limit_secs = worker.policy().hard_time_limit().as_secs(),
        soft_limit_secs = worker.policy().soft_time_limit().as_secs(),
        max_tasks = worker.policy().max_tasks_per_worker(),
        "Worker ready, starting job processing loop"
    );

    let handled = run(&state, &worker, poll_interval).await;

    // The process supervisor starts a fresh worker
    tracing::info!(handled, "Task limit reached, worker exiting for recycle");
}

/// Process deliveries one at a time until the recycle bound is reached.
///
/// Skipped deliveries are acknowledged without counting toward the bound.
async fn run(state: &AppState, worker: &Worker, poll_interval: Duration) -> u32 {
    let max_tasks = worker.policy().max_tasks_per_worker();
    let mut handled = 0;

    while handled < max_tasks {
        let delivery = match state.queue.dequeue().await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                idle(state, worker).await;
                sleep(poll_interval).await;
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to dequeue, will retry");
                sleep(poll_interval).await;
                continue;
            }
        };

        let job_id = delivery.job_id();
        let result = worker.run_delivery(delivery).await;
        if DeliveryOutcome::counts_toward_recycle(&result) {
            handled += 1;
        }
        match result {
            Ok(DeliveryOutcome::Processed(_)) => {
                tracing::debug!(job_id = %job_id, handled, "Job processed, checking for next job");
            }
            Ok(DeliveryOutcome::Skipped(reason)) => {
                tracing::debug!(job_id = %job_id, reason = %reason, "Delivery skipped");
            }
            Err(e) => {
                tracing::debug!(job_id = %job_id, handled, error = %e, "Delivery ended in failure");
            }
        }
    }

    handled
}

/// Housekeeping between polls: settle lost deliveries and publish queue depth.
async fn idle(state: &AppState, worker: &Worker) {
    match worker.reap_lost_deliveries().await {
        Ok(0) => {}
        Ok(reaped) => tracing::info!(reaped, "Settled deliveries with lapsed leases"),
        Err(e) => tracing::warn!(error = %e, "Lease reaper pass failed"),
    }

    match state.queue.depth().await {
        Ok(depth) => metrics::gauge!("conversion_queue_depth").set(depth as f64),
        Err(e) => tracing::warn!(error = %e, "Failed to read queue depth"),
    }
}
