use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a conversion job.
///
/// Progresses `Uploading -> Uploaded -> Processing -> {Processed, Failed}`.
/// `Processed` and `Failed` are terminal.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Uploading,
    Uploaded,
    Processing,
    Processed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Processed | JobStatus::Failed)
    }

    /// Statuses a job may be in immediately before entering `self`.
    ///
    /// `Processing` may be re-entered by a redelivered task. `Failed` is
    /// reachable from `Uploaded` when a delivery dies before its first commit.
    pub fn predecessors(self) -> &'static [JobStatus] {
        match self {
            JobStatus::Uploading => &[],
            JobStatus::Uploaded => &[JobStatus::Uploading],
            JobStatus::Processing => &[JobStatus::Uploaded, JobStatus::Processing],
            JobStatus::Processed => &[JobStatus::Processing],
            JobStatus::Failed => &[JobStatus::Uploaded, JobStatus::Processing],
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        next.predecessors().contains(&self)
    }
}

/// A CAD conversion job as recorded in the durable store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversionJob {
    pub id: Uuid,
    pub filename: String,
    pub file_size: Option<i64>,
    pub input_url: Option<String>,
    pub output_url: Option<String>,
    pub status: JobStatus,
    pub metadata: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl ConversionJob {
    /// A freshly created job awaiting its upload.
    pub fn new(filename: impl Into<String>, file_size: Option<i64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            file_size,
            input_url: None,
            output_url: None,
            status: JobStatus::Uploading,
            metadata: None,
            error: None,
            created_at: Utc::now(),
            uploaded_at: None,
            processed_at: None,
        }
    }
}
