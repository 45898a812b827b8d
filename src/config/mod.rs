use serde::Deserialize;
use std::time::Duration;

use crate::services::converter::Deflection;
use crate::services::queue::DispatchPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Prometheus scrape listener of worker processes
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the task queue and result backend
    pub redis_queue_url: String,

    /// Redis connection string for the status cache
    pub redis_data_url: String,

    /// S3-compatible endpoint URL (e.g., "http://localhost:9000")
    pub blob_endpoint: String,

    #[serde(default = "default_blob_region")]
    pub blob_region: String,

    pub blob_access_key: String,

    pub blob_secret_key: String,

    /// Bucket holding uploaded CAD files
    #[serde(default = "default_input_bucket")]
    pub input_bucket: String,

    /// Bucket holding converted GLB meshes
    #[serde(default = "default_output_bucket")]
    pub output_bucket: String,

    /// Lifetime of presigned upload/download URLs
    #[serde(default = "default_one_hour")]
    pub presign_expiry_secs: u32,

    /// Sliding TTL of status snapshots
    #[serde(default = "default_one_hour_u64")]
    pub status_ttl_secs: u64,

    /// Mesh quality: maximum chordal deviation (smaller = finer)
    #[serde(default = "default_linear_deflection")]
    pub linear_deflection: f64,

    /// Mesh quality: maximum angular deviation in radians (smaller = finer)
    #[serde(default = "default_angular_deflection")]
    pub angular_deflection: f64,

    /// External STEP-to-GLB converter executable
    #[serde(default = "default_converter_command")]
    pub converter_command: String,

    #[serde(default = "default_task_time_limit")]
    pub task_time_limit_secs: u64,

    #[serde(default = "default_task_soft_time_limit")]
    pub task_soft_time_limit_secs: u64,

    /// Worker process exits after this many jobs so it can be restarted fresh
    #[serde(default = "default_max_tasks_per_worker")]
    pub max_tasks_per_worker: u32,

    #[serde(default = "default_one_hour_u64")]
    pub result_expires_secs: u64,

    #[serde(default = "default_delivery_lease")]
    pub delivery_lease_secs: u64,

    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9091".to_string()
}

fn default_blob_region() -> String {
    "us-east-1".to_string()
}

fn default_input_bucket() -> String {
    "stepfiles".to_string()
}

fn default_output_bucket() -> String {
    "renders".to_string()
}

fn default_one_hour() -> u32 {
    3600
}

fn default_one_hour_u64() -> u64 {
    3600
}

fn default_linear_deflection() -> f64 {
    0.1
}

fn default_angular_deflection() -> f64 {
    0.5
}

fn default_converter_command() -> String {
    "step2glb".to_string()
}

fn default_task_time_limit() -> u64 {
    600
}

fn default_task_soft_time_limit() -> u64 {
    540
}

fn default_max_tasks_per_worker() -> u32 {
    50
}

fn default_delivery_lease() -> u64 {
    60
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Build and validate the task dispatch policy.
    pub fn dispatch_policy(&self) -> Result<DispatchPolicy, ConfigError> {
        DispatchPolicy::new(
            Duration::from_secs(self.task_time_limit_secs),
            Duration::from_secs(self.task_soft_time_limit_secs),
            self.max_tasks_per_worker,
            Duration::from_secs(self.result_expires_secs),
            Duration::from_secs(self.delivery_lease_secs),
            self.max_deliveries,
        )
    }

    pub fn deflection(&self) -> Result<Deflection, ConfigError> {
        Deflection::new(self.linear_deflection, self.angular_deflection)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Soft time limit ({soft}s) must be below the hard limit ({hard}s)")]
    SoftLimitNotBelowHard { soft: u64, hard: u64 },

    #[error("Delivery lease ({lease}s) must be below the hard time limit ({hard}s)")]
    LeaseTooLong { lease: u64, hard: u64 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("Deflection parameters must be positive and finite")]
    InvalidDeflection,
}
