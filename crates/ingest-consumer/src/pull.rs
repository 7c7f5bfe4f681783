//! Pulls processing results from the processing engine.
//!
//! The engine hands results out through a cursor. Each batch is forwarded to
//! the processed-messages subject (or applied in-process in standalone
//! mode) before the cursor is stored, so a crash re-pulls rather than loses.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use prost::Message as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ingest_backpressure::{BackPressureMaterializer, ProcessingClient, PullStatus};
use ingest_processor::Processor;
use ingest_storage::keys;
use ingest_types::{BrokerMessage, PullSettings};

use crate::error::ConsumerError;
use crate::publisher::IngestPublisher;

/// Where pulled messages go.
#[derive(Clone)]
pub enum PullTarget {
    /// Published to the processed-messages subject
    Publish(IngestPublisher),
    /// Applied directly, without ordering checks
    Local,
}

/// Result of one pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStep {
    Handled(usize),
    Empty,
    /// The engine answered with an error status
    Failed,
}

pub struct PullWorker {
    processor: Processor,
    client: Arc<dyn ProcessingClient>,
    target: PullTarget,
    settings: PullSettings,
    partition: String,
    back_pressure: Option<BackPressureMaterializer>,
}

impl PullWorker {
    pub fn new(
        processor: Processor,
        client: Arc<dyn ProcessingClient>,
        target: PullTarget,
        settings: PullSettings,
        partition: impl Into<String>,
    ) -> Self {
        Self {
            processor,
            client,
            target,
            settings,
            partition: partition.into(),
            back_pressure: None,
        }
    }

    /// Pause pulling while ingest or indexing are backed up.
    pub fn with_back_pressure(mut self, materializer: BackPressureMaterializer) -> Self {
        self.back_pressure = Some(materializer);
        self
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub async fn cursor(&self) -> Result<Option<i64>, ConsumerError> {
        let key = keys::pull_cursor(&self.settings.pull_type_id, &self.partition);
        let mut txn = self.processor.driver().begin(true).await?;
        let cursor = txn
            .get(&key)
            .await?
            .and_then(|bytes| String::from_utf8_lossy(&bytes).trim().parse::<i64>().ok());
        txn.abort().await?;
        Ok(cursor)
    }

    async fn set_cursor(&self, cursor: i64) -> Result<(), ConsumerError> {
        let key = keys::pull_cursor(&self.settings.pull_type_id, &self.partition);
        let mut txn = self.processor.driver().begin(false).await?;
        txn.set(&key, cursor.to_string().into_bytes()).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Decode one base64 payload and forward it.
    pub async fn handle_payload(&self, payload: &str) -> Result<(), ConsumerError> {
        let data = STANDARD.decode(payload)?;
        let message = BrokerMessage::decode(data.as_slice())?;
        debug!(
            kbid = %message.kbid,
            uuid = %message.uuid,
            processing_id = %message.processing_id,
            "Pulled message"
        );
        match &self.target {
            PullTarget::Publish(publisher) => {
                publisher.commit_processed(&message, data).await?;
            }
            PullTarget::Local => {
                // No transport, so no seqid to check
                self.processor
                    .process(&message, 0, &self.partition, false)
                    .await?;
            }
        }
        Ok(())
    }

    /// Wait until ingest and indexing accept more work. Returns `false` when
    /// cancelled meanwhile.
    pub async fn back_pressure_check(&self, cancel: &CancellationToken) -> bool {
        let Some(materializer) = &self.back_pressure else {
            return true;
        };
        loop {
            let Err(e) = materializer
                .check_indexing()
                .and_then(|()| materializer.check_ingest())
            else {
                return true;
            };
            let wait = (e.try_after - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            warn!(
                partition = %self.partition,
                kind = %e.kind,
                sleep_ms = wait.as_millis(),
                "Back pressure active, pausing pull"
            );
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// One pull request and the handling of everything it returned.
    pub async fn pull_once(&self) -> Result<PullStep, ConsumerError> {
        let cursor = self.cursor().await?;
        let response = self
            .client
            .pull(&self.partition, cursor, self.settings.api_timeout())
            .await?;
        match response.status {
            PullStatus::Ok => {
                info!(partition = %self.partition, cursor = ?response.cursor, "Message received from processing");
                let mut handled = 0;
                for payload in response.all_payloads() {
                    self.handle_payload(payload).await?;
                    handled += 1;
                }
                if let Some(next) = response.cursor {
                    self.set_cursor(next).await?;
                }
                Ok(PullStep::Handled(handled))
            }
            PullStatus::Empty => {
                debug!(partition = %self.partition, "No messages waiting");
                Ok(PullStep::Empty)
            }
            PullStatus::Error => {
                warn!(partition = %self.partition, "Processing pull answered with error");
                Ok(PullStep::Failed)
            }
        }
    }

    /// Pull until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(partition = %self.partition, "Starting pull worker");
        loop {
            if !self.back_pressure_check(&cancel).await {
                break;
            }
            let pause = tokio::select! {
                _ = cancel.cancelled() => break,
                step = self.pull_once() => match step {
                    Ok(PullStep::Handled(_)) => Duration::ZERO,
                    Ok(PullStep::Empty) => self.settings.empty_backoff(),
                    Ok(PullStep::Failed) => self.settings.error_backoff(),
                    Err(e) => {
                        error!(partition = %self.partition, error = %e, "Error pulling messages from processing");
                        self.settings.error_backoff()
                    }
                },
            };
            if pause.is_zero() {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!(partition = %self.partition, "Pull worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use ingest_backpressure::{ProcessingError, ProcessingStats, PullResponse};
    use ingest_indexing::{IndexNodes, ShardCoordinator, ShardIndexer};
    use ingest_processor::{knowledgebox, Notifier, Resource};
    use ingest_storage::{Driver, MemoryBlobStorage};
    use ingest_types::{Basic, ConsumerSettings, FieldText, LockStrategy};
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedClient {
        responses: Mutex<VecDeque<PullResponse>>,
        cursors: Mutex<Vec<Option<i64>>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<PullResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                cursors: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ProcessingClient for ScriptedClient {
        async fn pull(
            &self,
            _partition: &str,
            cursor: Option<i64>,
            _timeout: Duration,
        ) -> Result<PullResponse, ProcessingError> {
            self.cursors.lock().unwrap().push(cursor);
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(PullResponse::empty))
        }

        async fn stats(&self, _kbid: &str, _timeout: Duration) -> Result<ProcessingStats, ProcessingError> {
            Ok(ProcessingStats::default())
        }
    }

    async fn processor() -> (Processor, String) {
        let driver = Driver::in_memory();
        let indexer = ShardIndexer::new(
            ShardCoordinator::new(LockStrategy::Priority),
            IndexNodes::in_memory(&["node-0".to_string()]),
            4,
        );
        let kbid = knowledgebox::create_knowledgebox(&driver, "kb", "KB", &["node-0".to_string()], None)
            .await
            .unwrap();
        let processor = Processor::new(driver, Arc::new(MemoryBlobStorage::new()), indexer, Notifier::default());
        (processor, kbid)
    }

    fn payload(kbid: &str, uuid: &str) -> String {
        let mut bm = BrokerMessage {
            kbid: kbid.into(),
            uuid: uuid.into(),
            slug: uuid.into(),
            basic: Some(Basic {
                title: "Pulled".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        bm.texts.insert(
            "body".into(),
            FieldText {
                body: "text".into(),
                ..Default::default()
            },
        );
        STANDARD.encode(bm.encode_to_vec())
    }

    fn ok(payloads: Vec<String>, cursor: i64) -> PullResponse {
        PullResponse {
            status: PullStatus::Ok,
            payload: None,
            payloads,
            cursor: Some(cursor),
        }
    }

    #[tokio::test]
    async fn test_local_mode_applies_and_stores_cursor() {
        let (processor, kbid) = processor().await;
        let client = Arc::new(ScriptedClient::new(vec![ok(
            vec![payload(&kbid, "r1"), payload(&kbid, "r2")],
            7,
        )]));
        let worker = PullWorker::new(
            processor.clone(),
            Arc::clone(&client) as Arc<dyn ProcessingClient>,
            PullTarget::Local,
            PullSettings::default(),
            "1",
        );

        assert_eq!(worker.pull_once().await.unwrap(), PullStep::Handled(2));
        assert_eq!(worker.cursor().await.unwrap(), Some(7));
        assert_eq!(worker.pull_once().await.unwrap(), PullStep::Empty);
        assert_eq!(*client.cursors.lock().unwrap(), vec![None, Some(7)]);

        let mut txn = processor.driver().begin(true).await.unwrap();
        assert!(Resource::load(&mut txn, &kbid, "r2").await.unwrap().is_some());
        // Local processing never touches the partition watermark
        assert_eq!(processor.sequence_guard().last_seqid("1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_publish_mode_forwards_to_processed_subject() {
        let (processor, kbid) = processor().await;
        let transport = MemoryTransport::new();
        transport.add_stream("kb-ingest", &["ingest.>", "ingest-processed"]);
        let publisher = IngestPublisher::new(
            Arc::new(transport.clone()),
            Arc::new(MemoryBlobStorage::new()),
            ConsumerSettings::default(),
        );
        let client = Arc::new(ScriptedClient::new(vec![PullResponse {
            status: PullStatus::Ok,
            payload: Some(payload(&kbid, "r1")),
            payloads: Vec::new(),
            cursor: Some(3),
        }]));
        let worker = PullWorker::new(
            processor,
            client,
            PullTarget::Publish(publisher),
            PullSettings::default(),
            "1",
        );

        assert_eq!(worker.pull_once().await.unwrap(), PullStep::Handled(1));
        assert_eq!(transport.stream_len("kb-ingest"), 1);
        assert_eq!(worker.cursor().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_bad_payload_keeps_cursor() {
        let (processor, _) = processor().await;
        let client = Arc::new(ScriptedClient::new(vec![ok(vec!["%%%".into()], 9)]));
        let worker = PullWorker::new(processor, client, PullTarget::Local, PullSettings::default(), "1");

        assert!(matches!(
            worker.pull_once().await,
            Err(ConsumerError::Decode(_))
        ));
        assert_eq!(worker.cursor().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (processor, kbid) = processor().await;
        let client = Arc::new(ScriptedClient::new(vec![ok(vec![payload(&kbid, "r1")], 1)]));
        let worker = Arc::new(PullWorker::new(
            processor.clone(),
            client,
            PullTarget::Local,
            PullSettings {
                empty_backoff_ms: 10,
                ..Default::default()
            },
            "1",
        ));
        let cancel = CancellationToken::new();
        let handle = {
            let worker = Arc::clone(&worker);
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(cancel).await })
        };
        for _ in 0..100 {
            if worker.cursor().await.unwrap() == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(worker.cursor().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_back_pressure_pauses_pulling() {
        let (processor, _) = processor().await;
        let transport = MemoryTransport::new();
        transport.add_stream("kb-ingest", &["ingest-processed"]);
        transport
            .pull_subscribe(crate::transport::SubscribeOptions {
                stream: "kb-ingest".into(),
                subject: "ingest-processed".into(),
                durable: "ingest-processed".into(),
                start_seq: None,
                ack_wait: Duration::from_secs(60),
                max_deliver: 1,
                max_ack_pending: 1,
            })
            .await
            .unwrap();
        for _ in 0..5 {
            transport
                .publish("ingest-processed", vec![1], crate::transport::Headers::new())
                .await
                .unwrap();
        }
        let materializer = BackPressureMaterializer::new(
            ingest_types::BackPressureSettings {
                enabled: true,
                max_ingest_pending: 2,
                ..Default::default()
            },
            processor.driver().clone(),
            Arc::new(transport.clone()),
            None,
            Vec::new(),
            "kb-ingest",
            "ingest-processed",
        );
        materializer.refresh_ingest().await;

        let worker = PullWorker::new(
            processor,
            Arc::new(ScriptedClient::new(Vec::new())),
            PullTarget::Local,
            PullSettings::default(),
            "1",
        )
        .with_back_pressure(materializer);
        let cancel = CancellationToken::new();
        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };
        assert!(!worker.back_pressure_check(&cancel).await);
        stopper.await.unwrap();
    }
}
