//! Error types shared by the ingestion crates.

use thiserror::Error;

/// Error type for the shared model and configuration layer.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Protobuf decode error
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Invalid input error
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
