//! Error types for shard indexing.

use thiserror::Error;

/// Errors that can occur while indexing into shards
#[derive(Error, Debug)]
pub enum IndexingError {
    /// The coordinator dropped a waiter without granting it
    #[error("Shard lock abandoned: {0}")]
    LockAbandoned(String),

    /// Replica points to a node we have no client for
    #[error("Unknown index node: {0}")]
    NodeNotFound(String),

    /// Node RPC failed
    #[error("Index node {node} failed: {status}")]
    Rpc { node: String, status: tonic::Status },

    /// Node answered but reported an error
    #[error("Index node {node} rejected operation: {detail}")]
    Rejected { node: String, detail: String },
}
