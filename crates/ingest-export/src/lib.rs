//! Export and import of knowledge boxes.
//!
//! ## Key Components
//!
//! - [`ExportStreamReader`] / [`ExportStreamWriter`]: the tagged,
//!   length-prefixed stream format
//! - [`Exporter`]: writes a KB as a stream
//! - [`Importer`]: restores a stream into a KB, resumable by byte offset
//! - [`ExportImportDataManager`]: stream payloads in blob storage
//! - [`ExportImportTasks`]: both directions as retryable tasks

mod binaries;
pub mod codec;
pub mod compat;
pub mod datamanager;
pub mod error;
pub mod exporter;
pub mod importer;
pub mod learning;
pub mod runner;

pub use codec::{BinaryPayload, BinaryStream, ExportItem, ExportStreamReader, ExportStreamWriter, StreamRead};
pub use compat::check_compatible;
pub use datamanager::ExportImportDataManager;
pub use error::ExportError;
pub use exporter::{ExportStats, Exporter};
pub use importer::{ImportStats, Importer, MAX_PROCESS_TRIES};
pub use learning::{KvLearningConfigProvider, LearningConfigProvider};
pub use runner::ExportImportTasks;
