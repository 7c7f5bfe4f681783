//! Wiring of the pipeline components for one process.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use ingest_backpressure::{
    BackPressureMaterializer, HttpProcessingClient, ProcessingClient, ProcessingClientConfig,
    QueueStats, QueueStatsError, INDEXING_STREAM,
};
use ingest_consumer::{
    ConsumerMode, IngestConsumer, IngestPublisher, MemoryTransport, PullTarget, PullWorker,
    Transport,
};
use ingest_export::{
    ExportImportDataManager, ExportImportTasks, Exporter, Importer, KvLearningConfigProvider,
};
use ingest_indexing::{IndexNodes, ShardCoordinator, ShardIndexer};
use ingest_processor::{Notifier, Processor};
use ingest_storage::{BlobStorage, Driver, LocalBlobStorage, MemoryBlobStorage};
use ingest_tasks::{Migrator, TaskStore};
use ingest_types::{KvBackendKind, Settings};

/// Queue depths for the back pressure materializer.
///
/// Index nodes run in-process, so their backlog is the indexer's in-flight
/// count; every other stream is answered by the transport.
#[derive(Clone)]
pub struct PipelineQueueStats {
    transport: MemoryTransport,
    indexer: ShardIndexer,
}

impl PipelineQueueStats {
    pub fn new(transport: MemoryTransport, indexer: ShardIndexer) -> Self {
        Self { transport, indexer }
    }
}

#[async_trait]
impl QueueStats for PipelineQueueStats {
    async fn consumer_pending(&self, stream: &str, consumer: &str) -> Result<u64, QueueStatsError> {
        if stream == INDEXING_STREAM {
            return Ok(self.indexer.in_flight() as u64);
        }
        QueueStats::consumer_pending(&self.transport, stream, consumer).await
    }
}

/// Everything a running process shares between its workers.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Settings,
    pub driver: Driver,
    pub blob: Arc<dyn BlobStorage>,
    pub transport: MemoryTransport,
    pub processor: Processor,
    pub materializer: BackPressureMaterializer,
    pub processing: Option<Arc<dyn ProcessingClient>>,
}

impl AppContext {
    /// Open storage and build the processor, transport and materializer.
    pub fn build(settings: Settings) -> Result<Self> {
        let (driver, blob): (Driver, Arc<dyn BlobStorage>) = match settings.kv_backend {
            KvBackendKind::Rocks => {
                let db_path = Path::new(&settings.db_path);
                if let Some(parent) = db_path.parent() {
                    fs::create_dir_all(parent).context("Failed to create database directory")?;
                }
                fs::create_dir_all(&settings.blob_path).context("Failed to create blob directory")?;
                info!(db_path = %settings.db_path, blob_path = %settings.blob_path, "Opening storage");
                (
                    Driver::from_settings(&settings).context("Failed to open storage")?,
                    Arc::new(LocalBlobStorage::new(&settings.blob_path)),
                )
            }
            KvBackendKind::Memory => (Driver::in_memory(), Arc::new(MemoryBlobStorage::new())),
        };

        let indexer = ShardIndexer::new(
            ShardCoordinator::new(settings.indexing.lock_strategy),
            IndexNodes::in_memory(&settings.indexing.index_nodes),
            settings.indexing.max_concurrent,
        );
        let processor = Processor::new(driver.clone(), Arc::clone(&blob), indexer.clone(), Notifier::default());

        let consumer = &settings.consumer;
        let transport = MemoryTransport::with_max_payload(settings.pull.max_message_size);
        let partition_subjects = format!("{}.>", consumer.subject_prefix);
        transport.add_stream(
            &consumer.stream,
            &[partition_subjects.as_str(), consumer.processed_subject.as_str()],
        );

        let processing: Option<Arc<dyn ProcessingClient>> =
            match ProcessingClientConfig::from_settings(&settings.pull) {
                Some(config) => Some(Arc::new(
                    HttpProcessingClient::new(config).context("Failed to build processing client")?,
                )),
                None => None,
            };

        let materializer = BackPressureMaterializer::new(
            settings.back_pressure.clone(),
            driver.clone(),
            Arc::new(PipelineQueueStats::new(transport.clone(), indexer)),
            processing.clone(),
            settings.indexing.index_nodes.clone(),
            consumer.stream.clone(),
            consumer.processed_subject.clone(),
        );

        Ok(Self {
            settings,
            driver,
            blob,
            transport,
            processor,
            materializer,
            processing,
        })
    }

    fn transport_handle(&self) -> Arc<dyn Transport> {
        Arc::new(self.transport.clone())
    }

    /// One ordered consumer per partition, plus the processed-results
    /// consumer unless results are applied in-process.
    pub fn consumers(&self) -> Vec<IngestConsumer> {
        let mut modes: Vec<ConsumerMode> = self
            .settings
            .partitions
            .iter()
            .cloned()
            .map(ConsumerMode::Partition)
            .collect();
        if !self.settings.standalone {
            modes.push(ConsumerMode::Processed);
        }
        modes
            .into_iter()
            .map(|mode| {
                IngestConsumer::new(
                    self.processor.clone(),
                    self.transport_handle(),
                    self.settings.consumer.clone(),
                    mode,
                )
            })
            .collect()
    }

    /// Pull workers, one per partition; empty without a processing engine.
    pub fn pull_workers(&self) -> Vec<PullWorker> {
        let Some(client) = &self.processing else {
            return Vec::new();
        };
        let target = if self.settings.standalone {
            PullTarget::Local
        } else {
            PullTarget::Publish(IngestPublisher::new(
                self.transport_handle(),
                Arc::clone(&self.blob),
                self.settings.consumer.clone(),
            ))
        };
        self.settings
            .partitions
            .iter()
            .map(|partition| {
                let worker = PullWorker::new(
                    self.processor.clone(),
                    Arc::clone(client),
                    target.clone(),
                    self.settings.pull.clone(),
                    partition.clone(),
                );
                if self.materializer.enabled() {
                    worker.with_back_pressure(self.materializer.clone())
                } else {
                    worker
                }
            })
            .collect()
    }

    pub fn migrator(&self) -> Migrator {
        Migrator::from_settings(self.driver.clone(), &self.settings)
    }

    pub fn export_tasks(&self) -> ExportImportTasks {
        let learning = Arc::new(KvLearningConfigProvider::new(self.driver.clone()));
        let data = ExportImportDataManager::new(Arc::clone(&self.blob), TaskStore::new(self.driver.clone()));
        let exporter = Exporter::new(self.driver.clone(), Arc::clone(&self.blob), learning.clone());
        let importer = Importer::new(self.processor.clone(), learning, self.settings.tasks.chunk_size);
        ExportImportTasks::new(data, exporter, importer, self.settings.tasks.max_tries)
    }
}
