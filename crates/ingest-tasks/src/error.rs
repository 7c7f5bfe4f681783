//! Error types for task execution, locking and migrations.

use std::time::Duration;

use ingest_processor::ProcessorError;
use ingest_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Another holder kept the lock for the whole wait
    #[error("Timed out after {waited:?} waiting for lock {name}")]
    LockTimeout { name: String, waited: Duration },

    #[error("Task not found: {kbid}/{task_id}")]
    NotFound { kbid: String, task_id: String },

    /// One or more migrations did not complete
    #[error("Migration failed: {0}")]
    Migration(String),

    /// The task body reported a failure
    #[error("Task failed: {0}")]
    Failed(String),
}
