//! Shard indexing for the kb-ingest pipeline.
//!
//! ## Key Components
//!
//! - [`ShardCoordinator`]: per-shard lock table with FIFO or priority waiters
//! - [`ShardLease`]: RAII grant returned by the coordinator
//! - [`IndexNodeClient`]: RPC contract of an index node
//! - [`ShardIndexer`]: applies index messages to every replica of a shard
//!
//! ## Example
//!
//! ```ignore
//! use ingest_indexing::{IndexNodes, ShardCoordinator, ShardIndexer};
//!
//! let indexer = ShardIndexer::new(ShardCoordinator::new(strategy), nodes, 16);
//! indexer.index(&shard, &index_message).await?;
//! ```

pub mod coordinator;
pub mod error;
pub mod indexer;
pub mod node;

pub use coordinator::{Priority, ShardCoordinator, ShardLease};
pub use error::IndexingError;
pub use indexer::{priority_for, ShardIndexer};
pub use node::{IndexNodeClient, IndexNodes, MemoryIndexNode};
