//! Persistence of [`TaskMetadata`] records under their knowledge box.

use futures::TryStreamExt;
use tracing::debug;

use ingest_storage::{keys, Driver};
use ingest_types::{TaskMetadata, TaskType};

use crate::error::TaskError;

#[derive(Clone)]
pub struct TaskStore {
    driver: Driver,
}

impl TaskStore {
    pub fn new(driver: Driver) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub async fn get(&self, kbid: &str, task_id: &str) -> Result<Option<TaskMetadata>, TaskError> {
        let mut txn = self.driver.begin(true).await?;
        Ok(txn.get_json(&keys::kb_task(kbid, task_id)).await?)
    }

    /// Overwrite the stored record. Blind write: never conflicts.
    pub async fn set(&self, metadata: &TaskMetadata) -> Result<(), TaskError> {
        let mut txn = self.driver.begin(false).await?;
        txn.set_json(&keys::kb_task(&metadata.kbid, &metadata.task_id), metadata)
            .await?;
        txn.commit().await?;
        debug!(
            kbid = %metadata.kbid,
            task_id = %metadata.task_id,
            status = ?metadata.status,
            tries = metadata.tries,
            "Stored task metadata"
        );
        Ok(())
    }

    /// Register a new SCHEDULED task with a fresh id.
    pub async fn create(&self, kbid: &str, task_type: TaskType) -> Result<TaskMetadata, TaskError> {
        let task_id = uuid::Uuid::new_v4().simple().to_string();
        let metadata = TaskMetadata::new(kbid, task_id, task_type);
        self.set(&metadata).await?;
        Ok(metadata)
    }

    /// Every task of a knowledge box, ordered by task id.
    pub async fn list(&self, kbid: &str) -> Result<Vec<TaskMetadata>, TaskError> {
        let mut txn = self.driver.begin(true).await?;
        let task_keys: Vec<String> = txn.keys(&keys::kb_tasks_prefix(kbid), None).try_collect().await?;
        let mut tasks = Vec::with_capacity(task_keys.len());
        for key in task_keys {
            if let Some(metadata) = txn.get_json::<TaskMetadata>(&key).await? {
                tasks.push(metadata);
            }
        }
        Ok(tasks)
    }

    pub async fn delete(&self, kbid: &str, task_id: &str) -> Result<bool, TaskError> {
        let key = keys::kb_task(kbid, task_id);
        let mut txn = self.driver.begin(false).await?;
        if txn.get(&key).await?.is_none() {
            txn.abort().await?;
            return Ok(false);
        }
        txn.delete(&key).await?;
        txn.commit().await?;
        Ok(true)
    }
}
