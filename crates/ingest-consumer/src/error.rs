//! Error types for the transport and its consumers.

use ingest_backpressure::ProcessingError;
use ingest_processor::ProcessorError;
use ingest_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection dropped; subscriptions must be set up again
    #[error("Transport disconnected: {0}")]
    Disconnected(String),

    #[error("No stream accepts subject {0}")]
    NoStream(String),

    #[error("Consumer {consumer} not found on stream {stream}")]
    ConsumerNotFound { stream: String, consumer: String },

    #[error("Payload of {size} bytes exceeds the transport maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Invalid reply subject: {0}")]
    InvalidReply(String),
}

/// Errors raised while consuming or pulling messages.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Processing API error: {0}")]
    Processing(#[from] ProcessingError),

    /// Payload is not a broker message
    #[error("Malformed message: {0}")]
    Decode(String),
}

impl From<prost::DecodeError> for ConsumerError {
    fn from(err: prost::DecodeError) -> Self {
        ConsumerError::Decode(err.to_string())
    }
}

impl From<base64::DecodeError> for ConsumerError {
    fn from(err: base64::DecodeError) -> Self {
        ConsumerError::Decode(err.to_string())
    }
}
