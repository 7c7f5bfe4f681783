//! Error types for export and import.

use ingest_processor::ProcessorError;
use ingest_storage::StorageError;
use ingest_tasks::TaskError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    /// Unknown tag, undecodable payload or truncated entry
    #[error("Wrong export stream format: {0}")]
    WrongExportStreamFormat(String),

    /// The export was produced with a different semantic model
    #[error("Incompatible export: exported with semantic model {exported}, destination uses {destination}")]
    IncompatibleExport { exported: String, destination: String },

    #[error("Knowledge box not found: {0}")]
    KnowledgeBoxNotFound(String),

    #[error("Export item of {0} bytes does not fit a 4-byte length")]
    ItemTooLarge(usize),

    /// A binary's stored size and its downloaded bytes disagree
    #[error("Binary {uri} has {actual} bytes, expected {expected}")]
    BinarySizeMismatch { uri: String, expected: u64, actual: u64 },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExportError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        ExportError::WrongExportStreamFormat(msg.into())
    }

    /// Carry an export error through a blob storage byte stream.
    pub(crate) fn into_storage(self) -> StorageError {
        match self {
            ExportError::Storage(e) => e,
            other => StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                other.to_string(),
            )),
        }
    }
}
