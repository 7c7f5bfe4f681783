//! `kb-ingest` daemon library exports.
//!
//! # Modules
//!
//! - `cli`: command-line parsing with clap
//! - `context`: builds the storage, processor, transport and materializer
//! - `commands`: start/stop/status, migrate, export and import

pub mod cli;
pub mod commands;
pub mod context;

pub use cli::{Cli, Commands};
pub use commands::{
    export_to_file, import_from_file, run_export, run_import, run_migrate, run_workers,
    show_status, start_daemon, stop_daemon,
};
pub use context::{AppContext, PipelineQueueStats};
