use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use step_render::app_state::AppState;
use step_render::config::AppConfig;
use step_render::{db, routes};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");
    let policy = config
        .dispatch_policy()
        .expect("Invalid task dispatch configuration");

    tracing::info!("Initializing step-render API server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!(
        input_bucket = %config.input_bucket,
        output_bucket = %config.output_bucket,
        "Connecting to blob storage, status cache and task queue"
    );
    let state = AppState::connect(&config, db_pool, policy)
        .expect("Failed to initialize service clients");
    state
        .ensure_buckets()
        .await
        .expect("Failed to prepare blob storage buckets");

    let app = Router::new()
        .nest("/api/v1", routes::api_router())
        .route("/health", get(routes::health::health_check))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024)); // uploads go straight to blob storage

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}

fn describe_metrics() {
    metrics::describe_counter!("conversion_jobs_total", "Uploads confirmed and dispatched");
    metrics::describe_counter!("conversion_jobs_completed", "Conversion jobs committed as processed");
    metrics::describe_counter!("conversion_jobs_failed", "Conversion jobs committed as failed");
    metrics::describe_counter!(
        "conversion_metadata_degraded",
        "Conversions that finished with placeholder metadata"
    );
    metrics::describe_counter!(
        "conversion_deliveries_redelivered",
        "Task deliveries returned to the queue"
    );
    metrics::describe_counter!(
        "conversion_deliveries_dead_lettered",
        "Task deliveries abandoned after the maximum attempts"
    );
    metrics::describe_histogram!(
        "conversion_processing_seconds",
        "Time spent converting one delivery"
    );
    metrics::describe_gauge!("conversion_queue_depth", "Tasks waiting for a worker");
}
