//! Error types for message processing.

use ingest_indexing::IndexingError;
use ingest_storage::StorageError;
use ingest_types::IngestError;
use thiserror::Error;

/// Errors that can occur while applying a broker message
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Metadata or blob store failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Index node dispatch failure
    #[error("Indexing error: {0}")]
    Indexing(#[from] IndexingError),

    /// Malformed model data
    #[error("Model error: {0}")]
    Model(#[from] IngestError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Knowledge box not found: {0}")]
    KnowledgeBoxNotFound(String),

    #[error("Knowledge box slug already taken: {0}")]
    KnowledgeBoxConflict(String),

    #[error("No shards for knowledge box {0}")]
    ShardsNotFound(String),

    /// The partition watermark already covers this seqid
    #[error("Sequence order violation on partition {partition}: seqid {seqid} <= last {last_seqid}")]
    SequenceOrderViolation {
        partition: String,
        seqid: i64,
        last_seqid: i64,
    },

    /// The message was stored out of band and must not be retried
    #[error("Message {kbid}/{uuid} at seqid {seqid} deadlettered: {cause}")]
    Deadlettered {
        kbid: String,
        uuid: String,
        seqid: i64,
        cause: String,
    },
}

impl ProcessorError {
    /// A store write raced with another writer; the whole message can be retried.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ProcessorError::Storage(e) if e.is_conflict())
    }

    /// Failures that may succeed on redelivery.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProcessorError::Storage(
                StorageError::Conflict(_)
                    | StorageError::Io(_)
                    | StorageError::RocksDb(_)
                    | StorageError::Task(_)
                    | StorageError::TransactionClosed
            ) | ProcessorError::Indexing(IndexingError::Rpc { .. })
        )
    }

    /// Failures that pass through the deadletter policy untouched.
    pub(crate) fn bypasses_deadletter(&self) -> bool {
        self.is_transient()
            || matches!(
                self,
                ProcessorError::SequenceOrderViolation { .. }
                    | ProcessorError::ShardsNotFound(_)
                    | ProcessorError::KnowledgeBoxNotFound(_)
                    | ProcessorError::Deadlettered { .. }
            )
    }
}
