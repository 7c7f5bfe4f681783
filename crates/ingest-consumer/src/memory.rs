//! In-process transport with durable pull consumers.
//!
//! Used by standalone deployments and tests. Streams keep every published
//! message; consumers track deliveries, ack deadlines and redelivery counts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use ingest_backpressure::{QueueStats, QueueStatsError};

use crate::error::TransportError;
use crate::transport::{
    parse_reply_seq, reply_subject, Acker, Headers, SubscribeOptions, Subscription, Transport,
    TransportMessage,
};

const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

struct StoredMessage {
    seq: u64,
    subject: String,
    data: Vec<u8>,
    headers: Headers,
}

struct StreamState {
    subjects: Vec<String>,
    messages: Vec<StoredMessage>,
    last_seq: u64,
}

struct ConsumerState {
    filter: String,
    first_seq: u64,
    next_seq: u64,
    consumer_seq: u64,
    ack_wait: Duration,
    max_deliver: u32,
    max_ack_pending: usize,
    /// Delivered, not yet acked: stream seq -> redelivery deadline
    in_flight: BTreeMap<u64, Instant>,
    acked: BTreeSet<u64>,
    /// Gave up after `max_deliver` attempts
    terminated: BTreeSet<u64>,
    delivered: HashMap<u64, u32>,
}

#[derive(Default)]
struct State {
    connected: bool,
    streams: HashMap<String, StreamState>,
    consumers: HashMap<(String, String), ConsumerState>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    max_payload: usize,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Subject filter: exact match, or `prefix.>` for everything below `prefix`.
fn subject_matches(pattern: &str, subject: &str) -> bool {
    match pattern.strip_suffix('>') {
        Some(prefix) => subject.starts_with(prefix) && subject.len() > prefix.len(),
        None => pattern == subject,
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    connected: true,
                    ..Default::default()
                }),
                notify: Notify::new(),
                max_payload,
            }),
        }
    }

    /// Create `name` capturing `subjects` (exact or `prefix.>`). Existing
    /// streams keep their messages and get the new subject list.
    pub fn add_stream(&self, name: &str, subjects: &[&str]) {
        let mut state = self.inner.lock();
        let subjects: Vec<String> = subjects.iter().map(|s| s.to_string()).collect();
        state
            .streams
            .entry(name.to_string())
            .and_modify(|stream| stream.subjects = subjects.clone())
            .or_insert_with(|| StreamState {
                subjects,
                messages: Vec::new(),
                last_seq: 0,
            });
    }

    /// Drop the connection: every call fails with `Disconnected` until
    /// [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.inner.lock().connected = false;
        self.inner.notify.notify_waiters();
    }

    pub fn reconnect(&self) {
        self.inner.lock().connected = true;
        self.inner.notify.notify_waiters();
    }

    /// Messages stored on `stream`.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.inner
            .lock()
            .streams
            .get(stream)
            .map_or(0, |s| s.messages.len())
    }

    /// Times `seq` was delivered to `consumer`.
    pub fn delivery_count(&self, stream: &str, consumer: &str, seq: u64) -> u32 {
        self.inner
            .lock()
            .consumers
            .get(&(stream.to_string(), consumer.to_string()))
            .and_then(|c| c.delivered.get(&seq).copied())
            .unwrap_or(0)
    }

    fn check_connected(state: &State) -> Result<(), TransportError> {
        if state.connected {
            Ok(())
        } else {
            Err(TransportError::Disconnected("memory transport is offline".to_string()))
        }
    }

    fn collect(
        state: &mut State,
        stream_name: &str,
        durable: &str,
        batch: usize,
        acker: &Arc<MemoryAcker>,
    ) -> Result<Vec<TransportMessage>, TransportError> {
        Self::check_connected(state)?;
        let State {
            streams, consumers, ..
        } = state;
        let stream = streams
            .get(stream_name)
            .ok_or_else(|| TransportError::NoStream(stream_name.to_string()))?;
        let consumer = consumers
            .get_mut(&(stream_name.to_string(), durable.to_string()))
            .ok_or_else(|| TransportError::ConsumerNotFound {
                stream: stream_name.to_string(),
                consumer: durable.to_string(),
            })?;

        let now = Instant::now();
        let expired: Vec<u64> = consumer
            .in_flight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        let mut due = Vec::new();
        for seq in expired {
            consumer.in_flight.remove(&seq);
            if consumer.delivered.get(&seq).copied().unwrap_or(0) >= consumer.max_deliver {
                warn!(stream = %stream_name, consumer = %durable, seq, "Max deliveries reached, dropping message");
                consumer.terminated.insert(seq);
            } else {
                due.push(seq);
            }
        }

        let mut out = Vec::new();
        let deliver = |consumer: &mut ConsumerState, message: &StoredMessage| {
            let count = consumer.delivered.entry(message.seq).or_insert(0);
            *count += 1;
            let delivered = *count;
            consumer.consumer_seq += 1;
            consumer
                .in_flight
                .insert(message.seq, now + consumer.ack_wait);
            TransportMessage::new(
                message.subject.clone(),
                reply_subject(stream_name, durable, delivered, message.seq, consumer.consumer_seq),
                message.data.clone(),
                message.headers.clone(),
                delivered,
                Arc::clone(acker) as Arc<dyn Acker>,
            )
        };

        for seq in due {
            if out.len() >= batch || consumer.in_flight.len() >= consumer.max_ack_pending {
                // Still owed a redelivery: keep it first in line
                consumer.in_flight.insert(seq, now);
                continue;
            }
            if let Some(message) = stream.messages.iter().find(|m| m.seq == seq) {
                out.push(deliver(consumer, message));
            }
        }
        for message in &stream.messages {
            if message.seq < consumer.next_seq {
                continue;
            }
            if out.len() >= batch || consumer.in_flight.len() >= consumer.max_ack_pending {
                break;
            }
            consumer.next_seq = message.seq + 1;
            if !subject_matches(&consumer.filter, &message.subject)
                || consumer.acked.contains(&message.seq)
                || consumer.terminated.contains(&message.seq)
            {
                continue;
            }
            out.push(deliver(consumer, message));
        }
        Ok(out)
    }

    fn settle(&self, reply: &str, settle: impl FnOnce(&mut ConsumerState, u64)) -> Result<(), TransportError> {
        let seq = parse_reply_seq(reply)? as u64;
        let mut parts = reply.split('.').skip(2);
        let (Some(stream), Some(consumer)) = (parts.next(), parts.next()) else {
            return Err(TransportError::InvalidReply(reply.to_string()));
        };
        let mut state = self.inner.lock();
        Self::check_connected(&state)?;
        let consumer_state = state
            .consumers
            .get_mut(&(stream.to_string(), consumer.to_string()))
            .ok_or_else(|| TransportError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            })?;
        settle(consumer_state, seq);
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

struct MemoryAcker {
    transport: MemoryTransport,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self, reply: &str) -> Result<(), TransportError> {
        self.transport.settle(reply, |consumer, seq| {
            consumer.in_flight.remove(&seq);
            consumer.acked.insert(seq);
        })
    }

    async fn nak(&self, reply: &str, delay: Duration) -> Result<(), TransportError> {
        self.transport.settle(reply, |consumer, seq| {
            if let Some(deadline) = consumer.in_flight.get_mut(&seq) {
                *deadline = Instant::now() + delay;
            }
        })
    }

    async fn in_progress(&self, reply: &str) -> Result<(), TransportError> {
        self.transport.settle(reply, |consumer, seq| {
            let ack_wait = consumer.ack_wait;
            if let Some(deadline) = consumer.in_flight.get_mut(&seq) {
                *deadline = Instant::now() + ack_wait;
            }
        })
    }
}

struct MemorySubscription {
    transport: MemoryTransport,
    acker: Arc<MemoryAcker>,
    stream: String,
    durable: String,
    active: bool,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn fetch(&mut self, batch: usize, timeout: Duration) -> Result<Vec<TransportMessage>, TransportError> {
        if !self.active {
            return Err(TransportError::Disconnected("subscription closed".to_string()));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.transport.inner.notify.notified();
            {
                let mut state = self.transport.inner.lock();
                let messages = MemoryTransport::collect(
                    &mut state,
                    &self.stream,
                    &self.durable,
                    batch.max(1),
                    &self.acker,
                )?;
                if !messages.is_empty() {
                    return Ok(messages);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Redelivery deadlines pass without a notification
            let _ = tokio::time::timeout((deadline - now).min(POLL_INTERVAL), notified).await;
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), TransportError> {
        self.active = false;
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn pull_subscribe(
        &self,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let mut state = self.inner.lock();
        Self::check_connected(&state)?;
        if !state.streams.contains_key(&options.stream) {
            return Err(TransportError::NoStream(options.stream));
        }
        let key = (options.stream.clone(), options.durable.clone());
        let consumer = state.consumers.entry(key).or_insert_with(|| ConsumerState {
            filter: options.subject.clone(),
            first_seq: 1,
            next_seq: 1,
            consumer_seq: 0,
            ack_wait: options.ack_wait,
            max_deliver: options.max_deliver,
            max_ack_pending: options.max_ack_pending,
            in_flight: BTreeMap::new(),
            acked: BTreeSet::new(),
            terminated: BTreeSet::new(),
            delivered: HashMap::new(),
        });
        consumer.filter = options.subject.clone();
        consumer.ack_wait = options.ack_wait;
        consumer.max_deliver = options.max_deliver.max(1);
        consumer.max_ack_pending = options.max_ack_pending.max(1);
        if let Some(start_seq) = options.start_seq {
            let start_seq = start_seq.max(1);
            consumer.first_seq = start_seq;
            consumer.next_seq = start_seq;
            consumer.in_flight.clear();
            consumer.acked.retain(|seq| *seq < start_seq);
        }
        debug!(
            stream = %options.stream,
            durable = %options.durable,
            subject = %options.subject,
            start_seq = ?options.start_seq,
            "Pull subscription created"
        );
        Ok(Box::new(MemorySubscription {
            transport: self.clone(),
            acker: Arc::new(MemoryAcker {
                transport: self.clone(),
            }),
            stream: options.stream,
            durable: options.durable,
            active: true,
        }))
    }

    async fn publish(&self, subject: &str, data: Vec<u8>, headers: Headers) -> Result<u64, TransportError> {
        if data.len() > self.inner.max_payload {
            return Err(TransportError::PayloadTooLarge {
                size: data.len(),
                max: self.inner.max_payload,
            });
        }
        let seq = {
            let mut state = self.inner.lock();
            Self::check_connected(&state)?;
            let stream = state
                .streams
                .values_mut()
                .find(|s| s.subjects.iter().any(|p| subject_matches(p, subject)))
                .ok_or_else(|| TransportError::NoStream(subject.to_string()))?;
            stream.last_seq += 1;
            let seq = stream.last_seq;
            stream.messages.push(StoredMessage {
                seq,
                subject: subject.to_string(),
                data,
                headers,
            });
            seq
        };
        self.inner.notify.notify_waiters();
        Ok(seq)
    }

    async fn consumer_pending(&self, stream: &str, consumer: &str) -> Result<u64, TransportError> {
        let state = self.inner.lock();
        Self::check_connected(&state)?;
        let stream_state = state
            .streams
            .get(stream)
            .ok_or_else(|| TransportError::NoStream(stream.to_string()))?;
        let consumer_state = state
            .consumers
            .get(&(stream.to_string(), consumer.to_string()))
            .ok_or_else(|| TransportError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            })?;
        let pending = stream_state
            .messages
            .iter()
            .filter(|m| {
                m.seq >= consumer_state.first_seq
                    && subject_matches(&consumer_state.filter, &m.subject)
                    && !consumer_state.acked.contains(&m.seq)
                    && !consumer_state.terminated.contains(&m.seq)
            })
            .count();
        Ok(pending as u64)
    }

    fn max_payload(&self) -> usize {
        self.inner.max_payload
    }
}

#[async_trait]
impl QueueStats for MemoryTransport {
    async fn consumer_pending(&self, stream: &str, consumer: &str) -> Result<u64, QueueStatsError> {
        Transport::consumer_pending(self, stream, consumer)
            .await
            .map_err(|e| QueueStatsError {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn options(durable: &str, start_seq: Option<u64>) -> SubscribeOptions {
        SubscribeOptions {
            stream: "kb-ingest".into(),
            subject: "ingest.1".into(),
            durable: durable.into(),
            start_seq,
            ack_wait: Duration::from_secs(60),
            max_deliver: 3,
            max_ack_pending: 1,
        }
    }

    fn transport() -> MemoryTransport {
        let transport = MemoryTransport::new();
        transport.add_stream("kb-ingest", &["ingest.>", "ingest-processed"]);
        transport
    }

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("ingest.>", "ingest.1"));
        assert!(!subject_matches("ingest.>", "ingest."));
        assert!(!subject_matches("ingest.>", "ingest-processed"));
        assert!(subject_matches("ingest-processed", "ingest-processed"));
    }

    #[tokio::test]
    async fn test_publish_fetch_ack() {
        let t = transport();
        assert_eq!(t.publish("ingest.1", b"a".to_vec(), Headers::new()).await.unwrap(), 1);
        assert_eq!(t.publish("ingest.2", b"b".to_vec(), Headers::new()).await.unwrap(), 2);
        assert_eq!(t.publish("ingest.1", b"c".to_vec(), Headers::new()).await.unwrap(), 3);

        let mut sub = t.pull_subscribe(options("ingest-1", Some(1))).await.unwrap();
        let first = sub.fetch(10, Duration::from_millis(50)).await.unwrap();
        // max_ack_pending = 1
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].data, b"a");
        assert_eq!(first[0].seqid().unwrap(), 1);
        assert_eq!(Transport::consumer_pending(&t, "kb-ingest", "ingest-1").await.unwrap(), 2);

        first[0].ack().await.unwrap();
        let second = sub.fetch(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(second[0].seqid().unwrap(), 3);
        second[0].ack().await.unwrap();

        assert!(sub.fetch(1, Duration::from_millis(30)).await.unwrap().is_empty());
        assert_eq!(Transport::consumer_pending(&t, "kb-ingest", "ingest-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nak_redelivers_in_order() {
        let t = transport();
        t.publish("ingest.1", b"a".to_vec(), Headers::new()).await.unwrap();
        t.publish("ingest.1", b"b".to_vec(), Headers::new()).await.unwrap();
        let mut sub = t.pull_subscribe(options("ingest-1", Some(1))).await.unwrap();

        let first = sub.fetch(1, Duration::from_millis(50)).await.unwrap();
        first[0].nak(Duration::ZERO).await.unwrap();
        let again = sub.fetch(1, Duration::from_millis(200)).await.unwrap();
        assert_eq!(again[0].seqid().unwrap(), 1);
        assert_eq!(again[0].num_delivered, 2);
        assert_eq!(t.delivery_count("kb-ingest", "ingest-1", 1), 2);
    }

    #[tokio::test]
    async fn test_max_deliver_terminates() {
        let t = transport();
        t.publish("ingest.1", b"a".to_vec(), Headers::new()).await.unwrap();
        let mut sub = t.pull_subscribe(options("ingest-1", Some(1))).await.unwrap();
        for _ in 0..3 {
            let msgs = sub.fetch(1, Duration::from_millis(200)).await.unwrap();
            msgs[0].nak(Duration::ZERO).await.unwrap();
        }
        assert!(sub.fetch(1, Duration::from_millis(50)).await.unwrap().is_empty());
        assert_eq!(Transport::consumer_pending(&t, "kb-ingest", "ingest-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_from_start_seq() {
        let t = transport();
        for data in [b"a", b"b", b"c"] {
            t.publish("ingest.1", data.to_vec(), Headers::new()).await.unwrap();
        }
        let mut sub = t.pull_subscribe(options("ingest-1", Some(1))).await.unwrap();
        let msg = sub.fetch(1, Duration::from_millis(50)).await.unwrap();
        msg[0].ack().await.unwrap();

        let mut sub = t.pull_subscribe(options("ingest-1", Some(3))).await.unwrap();
        let msg = sub.fetch(1, Duration::from_millis(50)).await.unwrap();
        assert_eq!(msg[0].seqid().unwrap(), 3);
    }

    /// Acks at or after the new start sequence are forgotten, so the
    /// message at `start_seq` comes back even if it was acked before.
    #[tokio::test]
    async fn test_resubscribe_redelivers_acked_start_seq() {
        let t = transport();
        for data in [b"a", b"b", b"c"] {
            t.publish("ingest.1", data.to_vec(), Headers::new()).await.unwrap();
        }
        let mut sub = t.pull_subscribe(options("ingest-1", Some(1))).await.unwrap();
        for _ in 0..2 {
            let msg = sub.fetch(1, Duration::from_millis(50)).await.unwrap();
            msg[0].ack().await.unwrap();
        }

        let mut sub = t.pull_subscribe(options("ingest-1", Some(2))).await.unwrap();
        let msg = sub.fetch(1, Duration::from_millis(50)).await.unwrap();
        assert_eq!(msg[0].seqid().unwrap(), 2);
        assert_eq!(Transport::consumer_pending(&t, "kb-ingest", "ingest-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let t = transport();
        let mut sub = t.pull_subscribe(options("ingest-1", None)).await.unwrap();
        t.disconnect();
        assert!(matches!(
            sub.fetch(1, Duration::from_millis(10)).await,
            Err(TransportError::Disconnected(_))
        ));
        t.reconnect();
        assert!(sub.fetch(1, Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payload_limit_and_unknown_subject() {
        let t = MemoryTransport::with_max_payload(4);
        t.add_stream("kb-ingest", &["ingest.>"]);
        assert!(matches!(
            t.publish("ingest.1", vec![0; 5], Headers::new()).await,
            Err(TransportError::PayloadTooLarge { size: 5, max: 4 })
        ));
        assert!(matches!(
            t.publish("other", vec![0], Headers::new()).await,
            Err(TransportError::NoStream(_))
        ));
    }
}
