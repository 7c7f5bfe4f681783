//! Restores an export stream into a knowledge box.

use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use ingest_processor::{knowledgebox, Processor, ProcessorError};
use ingest_storage::blob::kb_bucket;
use ingest_storage::ByteStream;
use ingest_tasks::TaskStore;
use ingest_types::{BrokerMessage, CloudFileSource, EntitiesGroups, Labels, TaskMetadata};

use crate::binaries::cloud_files_mut;
use crate::codec::{BinaryPayload, ExportItem, ExportStreamReader};
use crate::compat::check_compatible;
use crate::error::ExportError;
use crate::learning::LearningConfigProvider;

/// Attempts per broker message half before the import fails.
pub const MAX_PROCESS_TRIES: u32 = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub resources: u64,
    pub binaries: u64,
    pub entities: u64,
    pub labels: u64,
}

#[derive(Clone)]
pub struct Importer {
    processor: Processor,
    learning: Arc<dyn LearningConfigProvider>,
    chunk_size: usize,
    tasks: Option<TaskStore>,
}

impl Importer {
    pub fn new(processor: Processor, learning: Arc<dyn LearningConfigProvider>, chunk_size: usize) -> Self {
        Self {
            processor,
            learning,
            chunk_size: chunk_size.max(1),
            tasks: None,
        }
    }

    /// Persist progress of tracked imports after every entry.
    pub fn with_task_store(mut self, tasks: TaskStore) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Import `stream` into `kbid`.
    ///
    /// With a task, the stream is resumed at `task.offset` and the offset of
    /// the next entry is recorded as each entry is committed.
    pub async fn import_kb(
        &self,
        kbid: &str,
        stream: ByteStream<'static>,
        mut task: Option<&mut TaskMetadata>,
    ) -> Result<ImportStats, ExportError> {
        {
            let mut txn = self.processor.driver().begin(true).await?;
            if !knowledgebox::exists(&mut txn, kbid).await? {
                return Err(ExportError::KnowledgeBoxNotFound(kbid.to_string()));
            }
        }

        let mut reader = ExportStreamReader::new(stream);
        let exported = reader.maybe_read_learning_config().await?;
        let destination = self.learning.get(kbid).await?;
        check_compatible(exported.as_ref(), destination.as_ref())?;
        if let (Some(config), None) = (&exported, &destination) {
            self.learning.set(kbid, config).await?;
            info!(kbid = %kbid, model = %config.semantic_model, "Adopted exported learning config");
        }

        let resume_at = task.as_ref().map_or(0, |t| t.offset);
        if resume_at > reader.read_bytes() {
            let skip = resume_at - reader.read_bytes();
            reader.seek(skip).await?;
            info!(kbid = %kbid, offset = resume_at, "Resuming import");
        }

        let mut stats = ImportStats::default();
        while let Some(item) = reader.next_item().await? {
            match item {
                ExportItem::Resource(bm) => {
                    self.restore_resource(kbid, bm).await?;
                    stats.resources += 1;
                }
                ExportItem::Binary(payload) => {
                    self.import_binary(kbid, payload).await?;
                    stats.binaries += 1;
                }
                ExportItem::Entities(entities) => {
                    self.set_entities(kbid, &entities).await?;
                    stats.entities += 1;
                }
                ExportItem::Labels(labels) => {
                    self.set_labels(kbid, &labels).await?;
                    stats.labels += 1;
                }
            }
            if let Some(task) = task.as_deref_mut() {
                task.offset = reader.read_bytes();
                task.processed += 1;
                if let Some(tasks) = &self.tasks {
                    tasks.set(task).await?;
                }
            }
        }

        info!(
            kbid = %kbid,
            resources = stats.resources,
            binaries = stats.binaries,
            "Imported export stream"
        );
        Ok(stats)
    }

    /// Writer half first so the resource and its fields exist, then the
    /// extracted data.
    async fn restore_resource(&self, kbid: &str, mut bm: BrokerMessage) -> Result<(), ExportError> {
        bm.kbid = kbid.to_string();
        let bucket = kb_bucket(kbid);
        let source = self.processor.blob().source();
        for cloud_file in cloud_files_mut(&mut bm) {
            if cloud_file.source() == CloudFileSource::Export {
                cloud_file.bucket_name = bucket.clone();
                cloud_file.set_source(source);
            }
        }
        self.process_with_retry(&bm.writer_message()).await?;
        self.process_with_retry(&bm.processor_message()).await?;
        debug!(kbid = %kbid, uuid = %bm.uuid, "Restored resource");
        Ok(())
    }

    async fn process_with_retry(&self, bm: &BrokerMessage) -> Result<(), ExportError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.processor.process_direct(bm).await {
                Ok(_) => return Ok(()),
                Err(e @ ProcessorError::KnowledgeBoxNotFound(_)) => return Err(e.into()),
                Err(e) if attempts >= MAX_PROCESS_TRIES => return Err(e.into()),
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    warn!(
                        uuid = %bm.uuid,
                        attempt = attempts,
                        retry_in_ms = delay.as_millis(),
                        error = %e,
                        "Failed to restore broker message, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Upload the binary into the destination KB's bucket under the same key.
    async fn import_binary(&self, kbid: &str, payload: BinaryPayload<'_>) -> Result<(), ExportError> {
        let key = payload.cloud_file.uri.clone();
        let bucket = kb_bucket(kbid);
        let expected = payload.size();
        let chunks = payload
            .into_stream(self.chunk_size)
            .map_err(ExportError::into_storage)
            .boxed();
        let written = self
            .processor
            .blob()
            .upload_stream(&bucket, &key, chunks)
            .await?;
        debug!(kbid = %kbid, key = %key, size = written, "Imported binary");
        if written != expected {
            return Err(ExportError::BinarySizeMismatch {
                uri: key,
                expected,
                actual: written,
            });
        }
        Ok(())
    }

    async fn set_entities(&self, kbid: &str, entities: &EntitiesGroups) -> Result<(), ExportError> {
        let mut txn = self.processor.driver().begin(false).await?;
        knowledgebox::set_entities(&mut txn, kbid, entities).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn set_labels(&self, kbid: &str, labels: &Labels) -> Result<(), ExportError> {
        let mut txn = self.processor.driver().begin(false).await?;
        knowledgebox::set_labels(&mut txn, kbid, labels).await?;
        txn.commit().await?;
        Ok(())
    }
}
