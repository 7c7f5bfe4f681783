//! Bounded retries and terminal-state bookkeeping for background tasks.
//!
//! [`TaskRetryHandler::run`] wraps one attempt of an idempotent task:
//!
//! - FINISHED, ERRORED and CANCELLED tasks are skipped
//! - a task that already failed `max_tries` times is marked ERRORED without
//!   running again
//! - otherwise the task runs as RUNNING and ends FINISHED, or FAILED with
//!   one more try counted (ERRORED once the budget is spent)
//!
//! The record is written back after every attempt, whatever the outcome.
//! Redelivery of a failed attempt is left to the caller.

use std::future::Future;

use tracing::{info, warn};

use ingest_types::{TaskMetadata, TaskSettings, TaskStatus};

use crate::error::TaskError;
use crate::store::TaskStore;

#[derive(Clone)]
pub struct TaskRetryHandler {
    store: TaskStore,
    max_tries: u32,
}

impl TaskRetryHandler {
    pub fn new(store: TaskStore, max_tries: u32) -> Self {
        Self { store, max_tries }
    }

    pub fn from_settings(store: TaskStore, settings: &TaskSettings) -> Self {
        Self::new(store, settings.max_tries)
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// Run one attempt of `work`. Returns `Ok(None)` when the attempt was
    /// skipped.
    ///
    /// `work` receives a copy of the RUNNING record; progress it persists
    /// through the store is kept when the final status is written.
    pub async fn run<T, F, Fut>(&self, metadata: TaskMetadata, work: F) -> Result<Option<T>, TaskError>
    where
        F: FnOnce(TaskMetadata) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let mut metadata = metadata;
        if metadata.status.is_terminal() {
            info!(
                kbid = %metadata.kbid,
                task_id = %metadata.task_id,
                status = ?metadata.status,
                "Task already done, skipping"
            );
            return Ok(None);
        }

        if metadata.tries >= self.max_tries {
            warn!(
                kbid = %metadata.kbid,
                task_id = %metadata.task_id,
                tries = metadata.tries,
                "Task exceeded its retry budget"
            );
            metadata.set_status(TaskStatus::Errored);
            self.store.set(&metadata).await?;
            return Ok(None);
        }

        metadata.set_status(TaskStatus::Running);
        self.store.set(&metadata).await?;

        let outcome = work(metadata.clone()).await;

        let mut latest = match self.store.get(&metadata.kbid, &metadata.task_id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => metadata,
            Err(e) => {
                warn!(task_id = %metadata.task_id, error = %e, "Could not reload task metadata");
                metadata
            }
        };

        match outcome {
            Ok(value) => {
                latest.set_status(TaskStatus::Finished);
                self.store.set(&latest).await?;
                info!(kbid = %latest.kbid, task_id = %latest.task_id, "Task finished");
                Ok(Some(value))
            }
            Err(e) => {
                latest.tries += 1;
                let status = if latest.tries >= self.max_tries {
                    TaskStatus::Errored
                } else {
                    TaskStatus::Failed
                };
                latest.set_status(status);
                if let Err(store_err) = self.store.set(&latest).await {
                    warn!(task_id = %latest.task_id, error = %store_err, "Could not persist failed task");
                }
                warn!(
                    kbid = %latest.kbid,
                    task_id = %latest.task_id,
                    tries = latest.tries,
                    status = ?latest.status,
                    error = %e,
                    "Task attempt failed"
                );
                Err(e)
            }
        }
    }
}
