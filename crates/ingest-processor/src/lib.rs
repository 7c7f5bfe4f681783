//! Broker message processing for the kb-ingest pipeline.
//!
//! ## Key Components
//!
//! - [`SequenceGuard`]: per-partition watermark of applied seqids
//! - [`Processor`]: applies broker messages transactionally and dispatches
//!   the resulting index messages after commit
//! - [`Resource`] and [`knowledgebox`]: the records kept in the metadata store
//! - [`Notifier`]: broadcast of committed changes
//!
//! ## Message handling
//!
//! | type       | effect                                                      |
//! |------------|-------------------------------------------------------------|
//! | AUTOCOMMIT | create or merge the resource, index after commit            |
//! | DELETE     | drop the resource from the index, the store and blob storage |
//! | ROLLBACK   | nothing written, `Aborted` notification                     |

pub mod error;
pub mod index_message;
pub mod knowledgebox;
pub mod notifications;
pub mod processor;
pub mod resource;
pub mod sequence;

pub use error::ProcessorError;
pub use index_message::build_index_message;
pub use notifications::{Notification, Notifier, WriteType};
pub use processor::{ProcessOutcome, Processor};
pub use resource::Resource;
pub use sequence::{log_discard, Decision, SequenceGuard};
