//! Writes a knowledge box out as an export stream.

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use ingest_processor::{knowledgebox, Resource};
use ingest_storage::{BlobStorage, Driver};
use ingest_types::{CloudFile, CloudFileSource};

use crate::binaries::cloud_files_mut;
use crate::codec::ExportStreamWriter;
use crate::error::ExportError;
use crate::learning::LearningConfigProvider;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub resources: u64,
    pub binaries: u64,
    pub bytes: u64,
}

#[derive(Clone)]
pub struct Exporter {
    driver: Driver,
    blob: Arc<dyn BlobStorage>,
    learning: Arc<dyn LearningConfigProvider>,
}

impl Exporter {
    pub fn new(driver: Driver, blob: Arc<dyn BlobStorage>, learning: Arc<dyn LearningConfigProvider>) -> Self {
        Self {
            driver,
            blob,
            learning,
        }
    }

    /// Write the whole KB to `out`: learning config, then each resource's
    /// binaries followed by the resource, then entities and labels.
    pub async fn export_kb<W>(&self, kbid: &str, out: &mut W) -> Result<ExportStats, ExportError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let resources = {
            let mut txn = self.driver.begin(true).await?;
            if !knowledgebox::exists(&mut txn, kbid).await? {
                return Err(ExportError::KnowledgeBoxNotFound(kbid.to_string()));
            }
            knowledgebox::list_resources(&mut txn, kbid).await?
        };

        let mut stats = ExportStats::default();
        if let Some(config) = self.learning.get(kbid).await? {
            self.write(out, &ExportStreamWriter::learning_config(&config)?, &mut stats)
                .await?;
        }

        for uuid in resources {
            let mut txn = self.driver.begin(true).await?;
            let Some(resource) = Resource::load(&mut txn, kbid, &uuid).await? else {
                continue;
            };
            let mut bm = resource.to_broker_message(&mut txn).await?;
            txn.abort().await?;

            for cloud_file in take_binaries(&mut bm) {
                self.write_binary(out, &cloud_file, &mut stats).await?;
                stats.binaries += 1;
            }
            self.write(out, &ExportStreamWriter::resource(&bm)?, &mut stats)
                .await?;
            stats.resources += 1;
            debug!(kbid = %kbid, uuid = %uuid, "Exported resource");
        }

        let (entities, labels) = {
            let mut txn = self.driver.begin(true).await?;
            (
                knowledgebox::get_entities(&mut txn, kbid).await?.unwrap_or_default(),
                knowledgebox::get_labels(&mut txn, kbid).await?.unwrap_or_default(),
            )
        };
        self.write(out, &ExportStreamWriter::entities(&entities)?, &mut stats)
            .await?;
        self.write(out, &ExportStreamWriter::labels(&labels)?, &mut stats)
            .await?;
        out.flush().await?;

        info!(
            kbid = %kbid,
            resources = stats.resources,
            binaries = stats.binaries,
            bytes = stats.bytes,
            "Exported knowledge box"
        );
        Ok(stats)
    }

    async fn write<W>(&self, out: &mut W, bytes: &[u8], stats: &mut ExportStats) -> Result<(), ExportError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        out.write_all(bytes).await?;
        stats.bytes += bytes.len() as u64;
        Ok(())
    }

    /// Stream a binary from blob storage into the export without buffering it.
    async fn write_binary<W>(
        &self,
        out: &mut W,
        cloud_file: &CloudFile,
        stats: &mut ExportStats,
    ) -> Result<(), ExportError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let header = ExportStreamWriter::binary_header(cloud_file, cloud_file.size)?;
        self.write(out, &header, stats).await?;

        let mut chunks = self
            .blob
            .download(&cloud_file.bucket_name, &cloud_file.uri)
            .await?
            .map_err(ExportError::from);
        let mut written = 0u64;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            if written > cloud_file.size {
                break;
            }
            self.write(out, &chunk, stats).await?;
        }
        if written != cloud_file.size {
            return Err(ExportError::BinarySizeMismatch {
                uri: cloud_file.uri.clone(),
                expected: cloud_file.size,
                actual: written,
            });
        }
        Ok(())
    }
}

/// Binaries to ship with the resource. Externally hosted files stay out;
/// the ones shipped are marked as export-sourced in the message.
fn take_binaries(bm: &mut ingest_types::BrokerMessage) -> Vec<CloudFile> {
    let mut out = Vec::new();
    for cloud_file in cloud_files_mut(bm) {
        if cloud_file.source() == CloudFileSource::External {
            continue;
        }
        out.push(cloud_file.clone());
        cloud_file.set_source(CloudFileSource::Export);
    }
    out
}
