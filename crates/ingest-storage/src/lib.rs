//! Storage layer for the kb-ingest pipeline.
//!
//! Provides:
//! - An ordered key-value metadata store with RocksDB and in-memory backends
//! - Optimistic transactions with buffered writes and atomic commit
//! - The key layout shared by every crate (see [`keys`])
//! - Blob storage for binaries, deadletters and proxied stream messages

pub mod blob;
pub mod column_families;
pub mod db;
pub mod driver;
pub mod error;
pub mod keys;

pub use blob::{BlobStorage, ByteStream, LocalBlobStorage, MemoryBlobStorage};
pub use db::{KvBackend, MemoryKv, RocksKv};
pub use driver::{Driver, Transaction};
pub use error::StorageError;
