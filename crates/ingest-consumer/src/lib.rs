//! Transport side of the kb-ingest pipeline.
//!
//! ## Key Components
//!
//! - [`Transport`]: JetStream-style streams with durable pull consumers;
//!   [`MemoryTransport`] implements it in-process
//! - [`IngestConsumer`]: reads a partition (or the processed subject) and
//!   settles every delivery according to the processor's verdict
//! - [`MessageProgressUpdater`]: in-progress heartbeat while a message is
//!   being processed
//! - [`IngestPublisher`]: publishes broker messages, proxying oversized ones
//!   through blob storage
//! - [`PullWorker`]: moves processing results from the processing engine
//!   onto the transport

pub mod consumer;
pub mod error;
pub mod memory;
pub mod progress;
pub mod publisher;
pub mod pull;
pub mod transport;

pub use consumer::{ConsumerMode, Delivery, IngestConsumer};
pub use error::{ConsumerError, TransportError};
pub use memory::MemoryTransport;
pub use progress::MessageProgressUpdater;
pub use publisher::IngestPublisher;
pub use pull::{PullStep, PullTarget, PullWorker};
pub use transport::{
    Acker, Headers, SubscribeOptions, Subscription, Transport, TransportMessage,
};
