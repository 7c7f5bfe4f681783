//! Where export and import payloads and their task records live.

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use ingest_storage::blob::EXPORTS_BUCKET;
use ingest_storage::{BlobStorage, ByteStream, StorageError};
use ingest_tasks::TaskStore;
use ingest_types::TaskMetadata;

use crate::error::ExportError;
use crate::exporter::{ExportStats, Exporter};

/// Buffer between the exporter and the blob upload.
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Clone)]
pub struct ExportImportDataManager {
    blob: Arc<dyn BlobStorage>,
    tasks: TaskStore,
}

fn export_key(kbid: &str, export_id: &str) -> String {
    format!("{kbid}/export/{export_id}")
}

fn import_key(kbid: &str, import_id: &str) -> String {
    format!("{kbid}/import/{import_id}")
}

impl ExportImportDataManager {
    pub fn new(blob: Arc<dyn BlobStorage>, tasks: TaskStore) -> Self {
        Self { blob, tasks }
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub async fn get_metadata(&self, kbid: &str, task_id: &str) -> Result<TaskMetadata, ExportError> {
        self.tasks.get(kbid, task_id).await?.ok_or_else(|| {
            ExportError::Task(ingest_tasks::TaskError::NotFound {
                kbid: kbid.to_string(),
                task_id: task_id.to_string(),
            })
        })
    }

    pub async fn set_metadata(&self, metadata: &TaskMetadata) -> Result<(), ExportError> {
        Ok(self.tasks.set(metadata).await?)
    }

    /// Run the exporter straight into blob storage. A failed export leaves
    /// no partial payload behind.
    pub async fn upload_export(
        &self,
        exporter: &Exporter,
        kbid: &str,
        export_id: &str,
    ) -> Result<ExportStats, ExportError> {
        let key = export_key(kbid, export_id);
        let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);

        let produce = async move {
            let result = exporter.export_kb(kbid, &mut writer).await;
            let closed = writer.shutdown().await;
            drop(writer);
            let stats = result?;
            closed?;
            Ok::<_, ExportError>(stats)
        };
        let chunks: ByteStream<'static> = ReaderStream::new(reader)
            .map_ok(|bytes| bytes.to_vec())
            .map_err(StorageError::from)
            .boxed();
        let consume = self.blob.upload_stream(EXPORTS_BUCKET, &key, chunks);

        let (produced, uploaded) = tokio::join!(produce, consume);
        let failure = match (produced, uploaded) {
            (Ok(stats), Ok(size)) => {
                info!(kbid = %kbid, export_id = %export_id, size, "Stored export");
                return Ok(stats);
            }
            (Err(e), _) => e,
            (Ok(_), Err(e)) => e.into(),
        };
        if let Err(e) = self.blob.delete_upload(EXPORTS_BUCKET, &key).await {
            warn!(key = %key, error = %e, "Failed to remove partial export");
        }
        Err(failure)
    }

    pub async fn download_export(&self, kbid: &str, export_id: &str) -> Result<ByteStream<'static>, ExportError> {
        Ok(self.blob.download(EXPORTS_BUCKET, &export_key(kbid, export_id)).await?)
    }

    pub async fn delete_export(&self, kbid: &str, export_id: &str) -> Result<(), ExportError> {
        Ok(self.blob.delete_upload(EXPORTS_BUCKET, &export_key(kbid, export_id)).await?)
    }

    /// Keep an uploaded export stream until the import task runs.
    pub async fn upload_import(
        &self,
        kbid: &str,
        import_id: &str,
        stream: ByteStream<'_>,
    ) -> Result<u64, ExportError> {
        Ok(self
            .blob
            .upload_stream(EXPORTS_BUCKET, &import_key(kbid, import_id), stream)
            .await?)
    }

    pub async fn download_import(&self, kbid: &str, import_id: &str) -> Result<ByteStream<'static>, ExportError> {
        Ok(self.blob.download(EXPORTS_BUCKET, &import_key(kbid, import_id)).await?)
    }

    pub async fn delete_import(&self, kbid: &str, import_id: &str) -> Result<(), ExportError> {
        Ok(self.blob.delete_upload(EXPORTS_BUCKET, &import_key(kbid, import_id)).await?)
    }
}
