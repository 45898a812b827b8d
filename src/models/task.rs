use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of one enqueued delivery of a job.
///
/// Only ever stored in the status cache and the queue's result backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Execution state reported by the task result backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStateKind {
    Pending,
    Started,
    Retry,
    Success,
    Failure,
}

/// Live state of a task handle, with the task's return value or error once finished.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskState {
    pub state: TaskStateKind,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    pub fn new(state: TaskStateKind) -> Self {
        Self {
            state,
            result: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn succeeded(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::new(TaskStateKind::Success)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(TaskStateKind::Failure)
        }
    }

    /// Whether the backend holds a structured result or exception for this task.
    pub fn has_outcome(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }
}
