//! Export and import as retryable background tasks.

use tracing::info;

use ingest_storage::ByteStream;
use ingest_tasks::{TaskError, TaskRetryHandler};
use ingest_types::{TaskMetadata, TaskType};

use crate::datamanager::ExportImportDataManager;
use crate::error::ExportError;
use crate::exporter::{ExportStats, Exporter};
use crate::importer::{ImportStats, Importer};

#[derive(Clone)]
pub struct ExportImportTasks {
    data: ExportImportDataManager,
    exporter: Exporter,
    importer: Importer,
    retry: TaskRetryHandler,
}

impl ExportImportTasks {
    pub fn new(
        data: ExportImportDataManager,
        exporter: Exporter,
        importer: Importer,
        max_tries: u32,
    ) -> Self {
        let retry = TaskRetryHandler::new(data.tasks().clone(), max_tries);
        let importer = importer.with_task_store(data.tasks().clone());
        Self {
            data,
            exporter,
            importer,
            retry,
        }
    }

    pub fn data(&self) -> &ExportImportDataManager {
        &self.data
    }

    /// Register an export of `kbid`.
    pub async fn start_export(&self, kbid: &str) -> Result<TaskMetadata, ExportError> {
        let task = self.data.tasks().create(kbid, TaskType::Export).await?;
        info!(kbid = %kbid, export_id = %task.task_id, "Scheduled export");
        Ok(task)
    }

    /// One attempt of an export task. `None` when the task was skipped.
    pub async fn run_export(&self, task: TaskMetadata) -> Result<Option<ExportStats>, ExportError> {
        let outcome = self
            .retry
            .run(task, |meta| async move {
                self.data
                    .upload_export(&self.exporter, &meta.kbid, &meta.task_id)
                    .await
                    .map_err(|e| TaskError::Failed(e.to_string()))
            })
            .await?;
        Ok(outcome)
    }

    /// Store an export stream and register its import into `kbid`.
    pub async fn start_import(&self, kbid: &str, stream: ByteStream<'_>) -> Result<TaskMetadata, ExportError> {
        let mut task = self.data.tasks().create(kbid, TaskType::Import).await?;
        let size = self.data.upload_import(kbid, &task.task_id, stream).await?;
        task.total = size;
        self.data.set_metadata(&task).await?;
        info!(kbid = %kbid, import_id = %task.task_id, size, "Scheduled import");
        Ok(task)
    }

    /// One attempt of an import task, resuming after the last entry a
    /// previous attempt committed.
    pub async fn run_import(&self, task: TaskMetadata) -> Result<Option<ImportStats>, ExportError> {
        let kbid = task.kbid.clone();
        let import_id = task.task_id.clone();
        let outcome = self
            .retry
            .run(task, |mut meta| async move {
                let result: Result<ImportStats, ExportError> = async {
                    let stream = self.data.download_import(&meta.kbid, &meta.task_id).await?;
                    let kbid = meta.kbid.clone();
                    self.importer.import_kb(&kbid, stream, Some(&mut meta)).await
                }
                .await;
                result.map_err(|e| TaskError::Failed(e.to_string()))
            })
            .await?;
        if outcome.is_some() {
            self.data.delete_import(&kbid, &import_id).await?;
        }
        Ok(outcome)
    }
}
