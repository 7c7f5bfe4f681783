//! Long-running task metadata (exports, imports, migrations).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Scheduled,
    Running,
    Finished,
    /// Last attempt failed; may be retried.
    Failed,
    /// Retry budget exhausted.
    Errored,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Errored | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Export,
    Import,
    Migration,
}

/// Persisted record of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub task_id: String,
    pub kbid: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Failed attempts so far
    #[serde(default)]
    pub tries: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    /// Items processed so far
    #[serde(default)]
    pub processed: u64,
    /// Total items, when known
    #[serde(default)]
    pub total: u64,
    /// Byte offset of the last committed import item
    #[serde(default)]
    pub offset: u64,
}

impl TaskMetadata {
    pub fn new(kbid: impl Into<String>, task_id: impl Into<String>, task_type: TaskType) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            kbid: kbid.into(),
            task_type,
            status: TaskStatus::Scheduled,
            tries: 0,
            created_at: now,
            updated_at: now,
            processed: 0,
            total: 0,
            offset: 0,
        }
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
