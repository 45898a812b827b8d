use serde::{Deserialize, Serialize};

use super::job::JobStatus;
use super::task::TaskHandle;

/// Advisory metadata carried by a status snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMetadata {
    /// Coarse progress, 0..=100
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SnapshotMetadata {
    pub fn progress(progress: u8, message: impl Into<String>) -> Self {
        Self {
            progress: Some(progress.min(100)),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_render_url(mut self, url: impl Into<String>) -> Self {
        self.render_url = Some(url.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Best-effort view of a job's status held in the ephemeral cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub status: JobStatus,
    pub task_id: Option<TaskHandle>,
    #[serde(default)]
    pub metadata: SnapshotMetadata,
}
