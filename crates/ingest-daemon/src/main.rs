//! kb-ingest
//!
//! Ingestion daemon for knowledge boxes.
//!
//! # Usage
//!
//! ```bash
//! kb-ingest start [--partitions 1,2] [--db-path PATH] [--standalone]
//! kb-ingest stop
//! kb-ingest status
//! kb-ingest migrate [--target-version N] [--forever]
//! kb-ingest export KBID --output FILE
//! kb-ingest import KBID --input FILE
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/kb-ingest/config.toml)
//! 3. Environment variables (INGEST_*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use ingest_daemon::{
    run_export, run_import, run_migrate, show_status, start_daemon, stop_daemon, Cli, Commands,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();
    let log_level = cli.log_level.as_deref();

    match cli.command {
        Commands::Start {
            partitions,
            db_path,
            standalone,
        } => {
            start_daemon(config, log_level, partitions, db_path.as_deref(), standalone).await?;
        }
        Commands::Stop => {
            stop_daemon()?;
        }
        Commands::Status => {
            show_status()?;
        }
        Commands::Migrate {
            target_version,
            forever,
        } => {
            run_migrate(config, log_level, target_version, forever).await?;
        }
        Commands::Export { kbid, output } => {
            run_export(config, log_level, &kbid, &output).await?;
        }
        Commands::Import { kbid, input } => {
            run_import(config, log_level, &kbid, &input).await?;
        }
    }

    Ok(())
}
