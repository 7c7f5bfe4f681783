//! CLI argument parsing for `kb-ingest`.
//!
//! CLI flags override every other configuration source.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Knowledge box ingestion daemon
///
/// Consumes broker messages, applies them to the metadata store and keeps
/// the index nodes in sync.
#[derive(Parser, Debug)]
#[command(name = "kb-ingest")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides ~/.config/kb-ingest/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start consuming partitions
    Start {
        /// Partitions to consume (comma separated, overrides config)
        #[arg(short, long, value_delimiter = ',')]
        partitions: Option<Vec<String>>,

        /// Override database path
        #[arg(long)]
        db_path: Option<String>,

        /// Apply processing results in-process instead of through the transport
        #[arg(long)]
        standalone: bool,
    },

    /// Stop the running daemon
    Stop,

    /// Show daemon status
    Status,

    /// Run pending migrations
    Migrate {
        /// Stop at this version instead of the latest
        #[arg(long)]
        target_version: Option<u32>,

        /// Keep migrating new knowledge boxes every five minutes
        #[arg(long)]
        forever: bool,
    },

    /// Export a knowledge box to a file
    Export {
        /// Knowledge box to export
        kbid: String,

        /// Destination file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Import an export file into an existing knowledge box
    Import {
        /// Destination knowledge box
        kbid: String,

        /// Export file to read
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_start_with_partitions() {
        let cli = Cli::parse_from(["kb-ingest", "start", "--partitions", "1,2,3"]);
        match cli.command {
            Commands::Start {
                partitions,
                standalone,
                ..
            } => {
                assert_eq!(partitions, Some(vec!["1".into(), "2".into(), "3".into()]));
                assert!(!standalone);
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_cli_start_standalone() {
        let cli = Cli::parse_from(["kb-ingest", "start", "--standalone", "--db-path", "/tmp/db"]);
        match cli.command {
            Commands::Start {
                standalone,
                db_path,
                ..
            } => {
                assert!(standalone);
                assert_eq!(db_path.as_deref(), Some("/tmp/db"));
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from(["kb-ingest", "status", "--config", "/etc/kb.toml", "-l", "debug"]);
        assert_eq!(cli.config.as_deref(), Some("/etc/kb.toml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_cli_migrate() {
        let cli = Cli::parse_from(["kb-ingest", "migrate", "--target-version", "2"]);
        match cli.command {
            Commands::Migrate {
                target_version,
                forever,
            } => {
                assert_eq!(target_version, Some(2));
                assert!(!forever);
            }
            _ => panic!("Expected Migrate command"),
        }

        let cli = Cli::parse_from(["kb-ingest", "migrate", "--forever"]);
        assert!(matches!(cli.command, Commands::Migrate { forever: true, .. }));
    }

    #[test]
    fn test_cli_export_and_import() {
        let cli = Cli::parse_from(["kb-ingest", "export", "kb1", "-o", "kb1.export"]);
        match cli.command {
            Commands::Export { kbid, output } => {
                assert_eq!(kbid, "kb1");
                assert_eq!(output, PathBuf::from("kb1.export"));
            }
            _ => panic!("Expected Export command"),
        }

        let cli = Cli::parse_from(["kb-ingest", "import", "kb2", "--input", "kb1.export"]);
        assert!(matches!(cli.command, Commands::Import { ref kbid, .. } if kbid == "kb2"));
    }

    #[test]
    fn test_cli_stop() {
        let cli = Cli::parse_from(["kb-ingest", "stop"]);
        assert!(matches!(cli.command, Commands::Stop));
    }
}
