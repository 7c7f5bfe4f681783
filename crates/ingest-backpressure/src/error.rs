//! Error types for back pressure.

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Which signal triggered back pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackPressureKind {
    Indexing,
    Ingest,
    Processing,
}

impl fmt::Display for BackPressureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackPressureKind::Indexing => "indexing",
            BackPressureKind::Ingest => "ingest",
            BackPressureKind::Processing => "processing",
        };
        f.write_str(name)
    }
}

/// Writes should be retried no earlier than `try_after`.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Back pressure on {kind}: retry after {try_after}")]
pub struct BackPressureError {
    pub kind: BackPressureKind,
    pub try_after: DateTime<Utc>,
    /// Served from the retry-after cache rather than a fresh check
    pub cached: bool,
}

/// Failure reading a queue depth from the transport.
#[derive(Error, Debug)]
#[error("Queue stats unavailable for {stream}/{consumer}: {reason}")]
pub struct QueueStatsError {
    pub stream: String,
    pub consumer: String,
    pub reason: String,
}

/// Errors from the processing engine HTTP API.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Processing API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    Parse(String),
}
