use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::time::Instant;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub status_cache: ComponentHealth,
    pub task_queue: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn from_result<E: std::fmt::Display>(result: Result<(), E>, started: Instant) -> Self {
        match result {
            Ok(()) => Self {
                status: "ok".to_string(),
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
            Err(e) => {
                tracing::warn!(error = %e, "Health check failed");
                Self {
                    status: "error".to_string(),
                    latency_ms: None,
                }
            }
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /health: dependency status of the durable store, status cache and queue.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = Instant::now();
    let database = ComponentHealth::from_result(state.jobs.health_check().await, start);

    let start = Instant::now();
    let status_cache = ComponentHealth::from_result(state.cache.health_check().await, start);

    let start = Instant::now();
    let task_queue = ComponentHealth::from_result(state.queue.health_check().await, start);

    let all_healthy = database.is_ok() && status_cache.is_ok() && task_queue.is_ok();
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database,
            status_cache,
            task_queue,
        },
    };

    (status_code, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::MemoryBackends;
    use crate::services::queue::DispatchPolicy;

    #[tokio::test]
    async fn test_healthy_backends_report_ok() {
        let backends = MemoryBackends::new(DispatchPolicy::default());
        let (code, Json(body)) = health_check(State(backends.state())).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.status, "ok");
    }

    #[tokio::test]
    async fn test_cache_outage_reports_degraded() {
        let backends = MemoryBackends::new(DispatchPolicy::default());
        backends.cache.set_offline(true);
        let (code, Json(body)) = health_check(State(backends.state())).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.checks.status_cache.status, "error");
        assert_eq!(body.checks.database.status, "ok");
    }
}
