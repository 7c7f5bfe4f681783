//! Back pressure for the kb-ingest pipeline.
//!
//! Writers are asked to slow down when any of three queues grows past its
//! threshold:
//!
//! - **ingest**: processed messages waiting for the ingest consumer
//! - **indexing**: index messages waiting on the nodes a write lands on
//! - **processing**: resources queued in the processing engine for the KB
//!
//! The answer is a [`BackPressureError`] carrying a `try_after` estimate.

pub mod cache;
pub mod client;
pub mod error;
pub mod materializer;

pub use cache::TtlCache;
pub use client::{
    HttpProcessingClient, ProcessingClient, ProcessingClientConfig, ProcessingStats, PullResponse,
    PullStatus,
};
pub use error::{BackPressureError, BackPressureKind, ProcessingError, QueueStatsError};
pub use materializer::{
    estimate_try_after, indexing_consumer, BackPressureMaterializer, CacheStats, QueueStats,
    INDEXING_STREAM,
};
