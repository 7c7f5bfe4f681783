//! Transport consumer feeding broker messages to the processor.
//!
//! One consumer per partition reads `ingest.{partition}` in stream order and
//! applies messages with the ordering guard enabled. A second flavour reads
//! the processed-messages subject, where ordering is not guaranteed and the
//! guard is bypassed.
//!
//! Delivery outcome policy:
//!
//! | processor result              | transport action     |
//! |-------------------------------|----------------------|
//! | applied / skipped             | ack                  |
//! | sequence violation            | ack, logged          |
//! | deadlettered                  | ack                  |
//! | shards or KB not found        | ack, dropped         |
//! | malformed payload             | ack, dropped         |
//! | anything else                 | nak after a delay    |

use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::{backoff::Backoff, ExponentialBackoff};
use prost::Message as _;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ingest_processor::{log_discard, ProcessOutcome, Processor, ProcessorError};
use ingest_types::{
    BrokerMessage, BrokerMessageBlobReference, ConsumerSettings, MESSAGE_TYPE_HEADER,
    PROXY_MESSAGE_TYPE,
};

use crate::error::{ConsumerError, TransportError};
use crate::progress::MessageProgressUpdater;
use crate::transport::{SubscribeOptions, Subscription, Transport, TransportMessage};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);
const SLOW_MESSAGE: Duration = Duration::from_secs(10);

/// Which subject a consumer reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerMode {
    /// `ingest.{partition}`, strictly ordered
    Partition(String),
    /// Processing results, unordered
    Processed,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Processed,
    /// Dropped for ordering reasons
    Discarded,
    Deadlettered,
    /// Unrecoverable for this message; never retried
    Dropped,
    Nacked,
}

pub struct IngestConsumer {
    processor: Processor,
    transport: Arc<dyn Transport>,
    settings: ConsumerSettings,
    mode: ConsumerMode,
    lock: Arc<Mutex<()>>,
}

impl IngestConsumer {
    pub fn new(
        processor: Processor,
        transport: Arc<dyn Transport>,
        settings: ConsumerSettings,
        mode: ConsumerMode,
    ) -> Self {
        Self {
            processor,
            transport,
            settings,
            mode,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Share the processing lock with other consumers.
    pub fn with_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.lock = lock;
        self
    }

    /// Partition label used for logs and the ordering guard.
    pub fn partition(&self) -> &str {
        match &self.mode {
            ConsumerMode::Partition(partition) => partition,
            ConsumerMode::Processed => &self.settings.processed_subject,
        }
    }

    fn transaction_check(&self) -> bool {
        matches!(self.mode, ConsumerMode::Partition(_))
    }

    async fn subscribe_options(&self) -> Result<SubscribeOptions, ConsumerError> {
        let (subject, durable, start_seq) = match &self.mode {
            ConsumerMode::Partition(partition) => {
                // Resume at the last applied seqid; its redelivery is a tail retry
                let last = self
                    .processor
                    .sequence_guard()
                    .last_seqid(partition)
                    .await?
                    .unwrap_or(1);
                (
                    self.settings.subject(partition),
                    self.settings.durable(partition),
                    Some(u64::try_from(last).unwrap_or(1)),
                )
            }
            ConsumerMode::Processed => (
                self.settings.processed_subject.clone(),
                self.settings.processed_subject.clone(),
                None,
            ),
        };
        Ok(SubscribeOptions {
            stream: self.settings.stream.clone(),
            subject,
            durable,
            start_seq,
            ack_wait: self.settings.ack_wait(),
            max_deliver: self.settings.max_deliver,
            // One at a time keeps redeliveries in stream order
            max_ack_pending: 1,
        })
    }

    pub async fn subscribe(&self) -> Result<Box<dyn Subscription>, ConsumerError> {
        let options = self.subscribe_options().await?;
        let subscription = self.transport.pull_subscribe(options.clone()).await?;
        info!(
            stream = %options.stream,
            subject = %options.subject,
            start_seq = ?options.start_seq,
            "Subscribed pull consumer"
        );
        Ok(subscription)
    }

    /// Consume until `cancel` fires. Lost connections are re-established
    /// from the last applied seqid.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(partition = %self.partition(), "Starting ingest consumer");
        while !cancel.is_cancelled() {
            let mut subscription = match self.subscribe().await {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(partition = %self.partition(), error = %e, "Subscription failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                    }
                }
            };
            loop {
                let fetched = tokio::select! {
                    _ = cancel.cancelled() => break,
                    fetched = subscription.fetch(1, self.settings.fetch_timeout()) => fetched,
                };
                match fetched {
                    Ok(messages) => {
                        for message in messages {
                            self.handle_message(message).await;
                        }
                    }
                    Err(TransportError::Disconnected(reason)) => {
                        warn!(partition = %self.partition(), reason = %reason, "Subscription lost, resubscribing");
                        break;
                    }
                    Err(e) => {
                        warn!(partition = %self.partition(), error = %e, "Fetch failed");
                        tokio::time::sleep(self.settings.nak_delay()).await;
                    }
                }
            }
            if let Err(e) = subscription.unsubscribe().await {
                debug!(error = %e, "Unsubscribe failed");
            }
            if !cancel.is_cancelled() {
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        }
        info!(partition = %self.partition(), "Ingest consumer stopped");
    }

    /// Decode a delivery, following blob references.
    pub async fn broker_message(&self, message: &TransportMessage) -> Result<BrokerMessage, ConsumerError> {
        let data = if message.header(MESSAGE_TYPE_HEADER) == Some(PROXY_MESSAGE_TYPE) {
            let reference = BrokerMessageBlobReference::decode(message.data.as_slice())?;
            self.processor
                .blob()
                .get_stream_message(&reference.storage_key)
                .await?
        } else {
            message.data.clone()
        };
        Ok(BrokerMessage::decode(data.as_slice())?)
    }

    async fn clean_broker_message(&self, message: &TransportMessage) {
        if message.header(MESSAGE_TYPE_HEADER) != Some(PROXY_MESSAGE_TYPE) {
            return;
        }
        let result = match BrokerMessageBlobReference::decode(message.data.as_slice()) {
            Ok(reference) => self
                .processor
                .blob()
                .del_stream_message(&reference.storage_key)
                .await
                .map_err(ConsumerError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(error = %e, "Could not delete blob reference");
        }
    }

    /// Process with in-place retries of store conflicts.
    async fn process(&self, message: &BrokerMessage, seqid: i64) -> Result<ProcessOutcome, ProcessorError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self
                .processor
                .process(message, seqid, self.partition(), self.transaction_check())
                .await
            {
                Err(e) if e.is_conflict() && attempts < self.settings.max_conflict_retries => {
                    let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    warn!(
                        seqid,
                        attempt = attempts,
                        retry_in_ms = delay.as_millis(),
                        "Store conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    /// Handle and settle one delivery.
    pub async fn handle_message(&self, message: TransportMessage) -> Delivery {
        let partition = self.partition().to_string();
        let seqid = match message.seqid() {
            Ok(seqid) => seqid,
            Err(e) => {
                error!(error = %e, "Delivery without a stream sequence, dropping");
                self.ack(&message, -1).await;
                return Delivery::Dropped;
            }
        };
        if message.num_delivered > 1 {
            warn!(
                seqid,
                subject = %message.subject,
                num_delivered = message.num_delivered,
                "Message has been redelivered"
            );
        }

        let progress = MessageProgressUpdater::start(message.clone(), self.settings.progress_interval());
        let _guard = self.lock.lock().await;
        let start = Instant::now();

        let delivery = match self.broker_message(&message).await {
            Err(ConsumerError::Decode(reason)) => {
                error!(seqid, partition = %partition, reason = %reason, "Malformed message, dropping");
                self.ack(&message, seqid).await;
                Delivery::Dropped
            }
            Err(e) => {
                error!(seqid, partition = %partition, error = %e, "Could not read message, will be retried");
                self.nak(&message, seqid).await;
                Delivery::Nacked
            }
            Ok(bm) => self.settle(&message, &bm, seqid, &partition, start).await,
        };
        progress.stop().await;
        delivery
    }

    async fn settle(
        &self,
        message: &TransportMessage,
        bm: &BrokerMessage,
        seqid: i64,
        partition: &str,
        start: Instant,
    ) -> Delivery {
        debug!(kbid = %bm.kbid, uuid = %bm.uuid, seqid, subject = %message.subject, "Message processing");
        match self.process(bm, seqid).await {
            Ok(outcome) => {
                let elapsed = start.elapsed();
                if elapsed < SLOW_MESSAGE {
                    info!(
                        kbid = %bm.kbid,
                        uuid = %bm.uuid,
                        seqid,
                        partition = %partition,
                        message_type = ?bm.message_type(),
                        source = ?bm.source(),
                        elapsed_ms = elapsed.as_millis(),
                        "Successfully processed message"
                    );
                } else {
                    warn!(
                        kbid = %bm.kbid,
                        uuid = %bm.uuid,
                        seqid,
                        partition = %partition,
                        elapsed_ms = elapsed.as_millis(),
                        "Slow message processing"
                    );
                }
                self.ack(message, seqid).await;
                self.clean_broker_message(message).await;
                match outcome {
                    ProcessOutcome::SkippedDuplicate { .. } => Delivery::Discarded,
                    ProcessOutcome::KnowledgeBoxDeleted => Delivery::Dropped,
                    _ => Delivery::Processed,
                }
            }
            Err(ProcessorError::SequenceOrderViolation { last_seqid, .. }) => {
                log_discard(partition, seqid, last_seqid);
                self.ack(message, seqid).await;
                Delivery::Discarded
            }
            Err(e @ ProcessorError::Deadlettered { .. }) => {
                info!(
                    kbid = %bm.kbid,
                    uuid = %bm.uuid,
                    seqid,
                    error = %e,
                    "Message stored in deadletter, acking"
                );
                self.ack(message, seqid).await;
                Delivery::Deadlettered
            }
            Err(e @ (ProcessorError::ShardsNotFound(_) | ProcessorError::KnowledgeBoxNotFound(_))) => {
                error!(
                    kbid = %bm.kbid,
                    uuid = %bm.uuid,
                    seqid,
                    error = %e,
                    "Message dropped and will not be retried"
                );
                self.ack(message, seqid).await;
                Delivery::Dropped
            }
            Err(e) => {
                error!(
                    kbid = %bm.kbid,
                    uuid = %bm.uuid,
                    seqid,
                    error = %e,
                    "Message not acked and will be retried"
                );
                self.nak(message, seqid).await;
                Delivery::Nacked
            }
        }
    }

    async fn ack(&self, message: &TransportMessage, seqid: i64) {
        match message.ack().await {
            Ok(()) => debug!(seqid, "Message acked"),
            Err(e) => warn!(seqid, error = %e, "Failed to ack message"),
        }
    }

    async fn nak(&self, message: &TransportMessage, seqid: i64) {
        let delay = self.settings.nak_delay();
        tokio::time::sleep(delay).await;
        if let Err(e) = message.nak(Duration::ZERO).await {
            warn!(seqid, error = %e, "Failed to nak message");
        }
    }
}
