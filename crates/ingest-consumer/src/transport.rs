//! Ordered, at-least-once message transport.
//!
//! The contract follows a JetStream-style pull consumer: messages live in
//! streams, durable consumers track acknowledgements, and every delivery
//! carries a reply subject of the form
//! `$JS.ACK.{stream}.{consumer}.{delivered}.{stream_seq}.{consumer_seq}.{ts}.{pending}`.
//! The stream sequence (position 5) is the seqid the ordering guard uses.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

pub type Headers = HashMap<String, String>;

/// Durable pull subscription parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub stream: String,
    pub subject: String,
    pub durable: String,
    /// First stream sequence to deliver; `None` resumes where the durable
    /// consumer left off
    pub start_seq: Option<u64>,
    pub ack_wait: Duration,
    pub max_deliver: u32,
    /// Deliveries allowed in flight before an ack
    pub max_ack_pending: usize,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn pull_subscribe(
        &self,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, TransportError>;

    /// Publish to the stream accepting `subject`. Returns the stream sequence.
    async fn publish(&self, subject: &str, data: Vec<u8>, headers: Headers) -> Result<u64, TransportError>;

    /// Messages of the consumer's filter not yet acknowledged.
    async fn consumer_pending(&self, stream: &str, consumer: &str) -> Result<u64, TransportError>;

    /// Largest payload `publish` accepts.
    fn max_payload(&self) -> usize;
}

#[async_trait]
pub trait Subscription: Send {
    /// Up to `batch` messages; empty after `timeout` without deliveries.
    async fn fetch(&mut self, batch: usize, timeout: Duration) -> Result<Vec<TransportMessage>, TransportError>;

    async fn unsubscribe(&mut self) -> Result<(), TransportError>;
}

/// Acknowledgement channel of a delivered message.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, reply: &str) -> Result<(), TransportError>;

    /// Negative ack; redelivery happens after `delay` (immediately if zero).
    async fn nak(&self, reply: &str, delay: Duration) -> Result<(), TransportError>;

    /// Reset the ack deadline of a message still being worked on.
    async fn in_progress(&self, reply: &str) -> Result<(), TransportError>;
}

/// One delivery of a stream message.
#[derive(Clone)]
pub struct TransportMessage {
    pub subject: String,
    pub reply: String,
    pub data: Vec<u8>,
    pub headers: Headers,
    pub num_delivered: u32,
    acker: Arc<dyn Acker>,
}

impl fmt::Debug for TransportMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportMessage")
            .field("subject", &self.subject)
            .field("reply", &self.reply)
            .field("len", &self.data.len())
            .field("num_delivered", &self.num_delivered)
            .finish()
    }
}

impl TransportMessage {
    pub fn new(
        subject: String,
        reply: String,
        data: Vec<u8>,
        headers: Headers,
        num_delivered: u32,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            subject,
            reply,
            data,
            headers,
            num_delivered,
            acker,
        }
    }

    /// Stream sequence encoded in the reply subject.
    pub fn seqid(&self) -> Result<i64, TransportError> {
        parse_reply_seq(&self.reply)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub async fn ack(&self) -> Result<(), TransportError> {
        self.acker.ack(&self.reply).await
    }

    pub async fn nak(&self, delay: Duration) -> Result<(), TransportError> {
        self.acker.nak(&self.reply, delay).await
    }

    pub async fn in_progress(&self) -> Result<(), TransportError> {
        self.acker.in_progress(&self.reply).await
    }
}

/// Build the reply subject of a delivery.
pub fn reply_subject(stream: &str, consumer: &str, delivered: u32, stream_seq: u64, consumer_seq: u64) -> String {
    let ts = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("$JS.ACK.{stream}.{consumer}.{delivered}.{stream_seq}.{consumer_seq}.{ts}.0")
}

pub fn parse_reply_seq(reply: &str) -> Result<i64, TransportError> {
    reply
        .split('.')
        .nth(5)
        .and_then(|seq| seq.parse::<i64>().ok())
        .ok_or_else(|| TransportError::InvalidReply(reply.to_string()))
}
