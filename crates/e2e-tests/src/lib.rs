//! End-to-end test infrastructure for kb-ingest.
//!
//! Provides a shared TestHarness: a full pipeline on a temporary RocksDB
//! store with in-process transport and index nodes, plus helpers for
//! publishing and draining partitions.

use std::time::Duration;

use ingest_consumer::{Delivery, IngestConsumer, IngestPublisher, Subscription, TransportMessage};
use ingest_daemon::AppContext;
use ingest_processor::knowledgebox;
use ingest_types::{Basic, BrokerMessage, FieldText, LearningConfiguration, Settings};

/// Shared test harness for E2E tests.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    pub ctx: AppContext,
}

impl TestHarness {
    /// Pipeline on a fresh RocksDB store with short transport timeouts.
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    /// Like [`new`](Self::new), with `configure` applied to the settings
    /// before anything is opened.
    pub fn with_settings(configure: impl FnOnce(&mut Settings)) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let mut settings = Settings {
            db_path: temp_dir.path().join("db").to_string_lossy().to_string(),
            blob_path: temp_dir.path().join("blobs").to_string_lossy().to_string(),
            ..Default::default()
        };
        settings.consumer.nak_delay_ms = 10;
        settings.consumer.fetch_timeout_ms = 50;
        configure(&mut settings);
        let ctx = AppContext::build(settings).expect("Failed to build app context");
        Self {
            _temp_dir: temp_dir,
            ctx,
        }
    }

    pub fn temp_path(&self) -> &std::path::Path {
        self._temp_dir.path()
    }

    /// Create a knowledge box spread over the configured index nodes.
    pub async fn create_kb(&self, slug: &str, learning: Option<&LearningConfiguration>) -> String {
        knowledgebox::create_knowledgebox(
            &self.ctx.driver,
            slug,
            slug,
            &self.ctx.settings.indexing.index_nodes,
            learning,
        )
        .await
        .expect("Failed to create knowledge box")
    }

    pub fn publisher(&self) -> IngestPublisher {
        IngestPublisher::new(
            std::sync::Arc::new(self.ctx.transport.clone()),
            std::sync::Arc::clone(&self.ctx.blob),
            self.ctx.settings.consumer.clone(),
        )
    }

    /// The ordered consumer of `partition`.
    pub fn partition_consumer(&self, partition: &str) -> IngestConsumer {
        self.ctx
            .consumers()
            .into_iter()
            .find(|c| c.partition() == partition)
            .unwrap_or_else(|| panic!("Partition {partition} is not configured"))
    }

    pub fn processed_consumer(&self) -> IngestConsumer {
        self.ctx
            .consumers()
            .into_iter()
            .find(|c| c.partition() == self.ctx.settings.consumer.processed_subject)
            .expect("Processed consumer not configured")
    }

    /// Publish `messages` to `partition`, returning their seqids.
    pub async fn publish_all(&self, partition: &str, messages: &[BrokerMessage]) -> Vec<u64> {
        let publisher = self.publisher();
        let mut seqids = Vec::with_capacity(messages.len());
        for message in messages {
            seqids.push(
                publisher
                    .commit(message, partition)
                    .await
                    .expect("Failed to publish"),
            );
        }
        seqids
    }

    /// Fetch and handle up to `count` deliveries from `subscription`.
    pub async fn drain(
        &self,
        consumer: &IngestConsumer,
        subscription: &mut Box<dyn Subscription>,
        count: usize,
    ) -> Vec<(i64, Delivery)> {
        let mut handled = Vec::with_capacity(count);
        while handled.len() < count {
            let messages: Vec<TransportMessage> = subscription
                .fetch(1, Duration::from_millis(500))
                .await
                .expect("Fetch failed");
            if messages.is_empty() {
                break;
            }
            for message in messages {
                let seqid = message.seqid().expect("Delivery without seqid");
                handled.push((seqid, consumer.handle_message(message).await));
            }
        }
        handled
    }

    pub async fn last_seqid(&self, partition: &str) -> Option<i64> {
        self.ctx
            .processor
            .sequence_guard()
            .last_seqid(partition)
            .await
            .expect("Failed to read partition watermark")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Writer message creating or updating `uuid` with one text field.
pub fn text_message(kbid: &str, uuid: &str, field: &str, body: &str) -> BrokerMessage {
    let mut bm = BrokerMessage {
        kbid: kbid.to_string(),
        uuid: uuid.to_string(),
        slug: uuid.to_string(),
        basic: Some(Basic {
            title: format!("Resource {uuid}"),
            ..Default::default()
        }),
        ..Default::default()
    };
    bm.texts.insert(
        field.to_string(),
        FieldText {
            body: body.to_string(),
            ..Default::default()
        },
    );
    bm
}
