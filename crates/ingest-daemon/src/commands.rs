//! Command implementations for `kb-ingest`.
//!
//! Handles:
//! - start: load config, open storage, run consumers until a signal arrives
//! - stop / status: via the PID file
//! - migrate, export, import: one-shot jobs against the same storage

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures::{StreamExt, TryStreamExt};
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use ingest_export::{ExportStats, ImportStats};
use ingest_storage::StorageError;
use ingest_types::Settings;

use crate::context::AppContext;

/// Get the PID file path
fn pid_file_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| {
            #[cfg(unix)]
            {
                dirs.runtime_dir()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| dirs.cache_dir().to_path_buf())
            }
            #[cfg(not(unix))]
            {
                dirs.cache_dir().to_path_buf()
            }
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("kb-ingest")
        .join("daemon.pid")
}

fn write_pid_file() -> Result<()> {
    let pid_path = pid_file_path();
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&pid_path, std::process::id().to_string())?;
    info!(path = ?pid_path, "Wrote PID file");
    Ok(())
}

fn remove_pid_file() {
    let pid_path = pid_file_path();
    if pid_path.exists() {
        if let Err(e) = fs::remove_file(&pid_path) {
            warn!(error = %e, "Failed to remove PID file");
        }
    }
}

fn read_pid_file() -> Option<u32> {
    fs::read_to_string(pid_file_path())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    // Signal 0 only checks that the process exists
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    true
}

/// Load layered settings and apply the global CLI overrides.
pub fn load_settings(config_path: Option<&str>, log_level: Option<&str>) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;
    if let Some(log_level) = log_level {
        settings.log_level = log_level.to_string();
    }
    Ok(settings)
}

/// `RUST_LOG` wins over the configured level.
pub fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

/// Apply `start` flags on top of the loaded settings.
pub fn apply_start_overrides(
    settings: &mut Settings,
    partitions: Option<Vec<String>>,
    db_path: Option<&str>,
    standalone: bool,
) -> Result<()> {
    if let Some(partitions) = partitions {
        settings.partitions = partitions;
    }
    if let Some(db_path) = db_path {
        settings.db_path = db_path.to_string();
    }
    if standalone {
        settings.standalone = true;
    }
    settings.validate().context("Invalid configuration")?;
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Run every worker of `ctx` until `cancel` fires, then drain in-flight
/// indexing.
pub async fn run_workers(ctx: &AppContext, cancel: CancellationToken) {
    let tracker = TaskTracker::new();

    if ctx.materializer.enabled() {
        let materializer = ctx.materializer.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move { materializer.run(cancel).await });
    }
    for consumer in ctx.consumers() {
        let cancel = cancel.clone();
        tracker.spawn(async move { consumer.run(cancel).await });
    }
    for worker in ctx.pull_workers() {
        let cancel = cancel.clone();
        tracker.spawn(async move { worker.run(cancel).await });
    }
    tracker.close();
    info!(workers = tracker.len(), "Workers started");

    tracker.wait().await;
    ctx.processor.indexer().wait_idle().await;
    info!("Workers stopped");
}

/// Start the ingest daemon.
///
/// 1. Load configuration (defaults, file, env, CLI)
/// 2. Open storage and build the pipeline
/// 3. Run consumers, pull workers and the materializer
/// 4. Shut down gracefully on SIGINT/SIGTERM
pub async fn start_daemon(
    config_path: Option<&str>,
    log_level: Option<&str>,
    partitions: Option<Vec<String>>,
    db_path: Option<&str>,
    standalone: bool,
) -> Result<()> {
    let mut settings = load_settings(config_path, log_level)?;
    apply_start_overrides(&mut settings, partitions, db_path, standalone)?;
    init_logging(&settings.log_level)?;

    info!(
        db_path = %settings.db_path,
        partitions = ?settings.partitions,
        standalone = settings.standalone,
        back_pressure = settings.back_pressure.enabled,
        "kb-ingest starting"
    );

    let ctx = AppContext::build(settings)?;
    write_pid_file()?;

    let cancel = CancellationToken::new();
    let workers = run_workers(&ctx, cancel.clone());
    tokio::pin!(workers);
    tokio::select! {
        _ = &mut workers => warn!("Workers exited before shutdown was requested"),
        _ = shutdown_signal() => {
            cancel.cancel();
            workers.await;
        }
    }

    remove_pid_file();
    Ok(())
}

/// Stop the running daemon by sending SIGTERM.
pub fn stop_daemon() -> Result<()> {
    let pid = read_pid_file().context("No PID file found - daemon may not be running")?;

    if !is_process_running(pid) {
        remove_pid_file();
        anyhow::bail!("Daemon not running (stale PID file removed)");
    }

    #[cfg(unix)]
    {
        unsafe {
            if libc::kill(pid as i32, libc::SIGTERM) != 0 {
                anyhow::bail!("Failed to send SIGTERM to daemon");
            }
        }
        println!("Sent SIGTERM to kb-ingest (PID {})", pid);
    }

    #[cfg(not(unix))]
    {
        anyhow::bail!("Stop command not yet implemented on this platform");
    }

    Ok(())
}

/// Show daemon status.
pub fn show_status() -> Result<()> {
    let pid_path = pid_file_path();
    match read_pid_file() {
        Some(pid) if is_process_running(pid) => {
            println!("kb-ingest is running (PID {})", pid);
            println!("PID file: {:?}", pid_path);
        }
        Some(pid) => {
            println!("kb-ingest is NOT running (stale PID {} in {:?})", pid, pid_path);
        }
        None => println!("kb-ingest is NOT running (no PID file)"),
    }
    Ok(())
}

/// Run migrations once, or every five minutes until a signal with `forever`.
pub async fn run_migrate(
    config_path: Option<&str>,
    log_level: Option<&str>,
    target_version: Option<u32>,
    forever: bool,
) -> Result<()> {
    let settings = load_settings(config_path, log_level)?;
    init_logging(&settings.log_level)?;
    let ctx = AppContext::build(settings)?;
    let migrator = ctx.migrator();

    if forever {
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            stop.cancel();
        });
        migrator.run_forever(cancel).await;
        return Ok(());
    }

    migrator.run(target_version).await.context("Migration failed")?;
    let info = migrator.global_info().await?;
    println!(
        "Migrated to version {} (latest {})",
        info.current_version,
        migrator.latest_version()
    );
    Ok(())
}

/// Export `kbid` through a tracked task and copy the payload to `output`.
pub async fn export_to_file(ctx: &AppContext, kbid: &str, output: &Path) -> Result<ExportStats> {
    let tasks = ctx.export_tasks();
    let task = tasks.start_export(kbid).await?;
    let stats = tasks
        .run_export(task.clone())
        .await
        .with_context(|| format!("Export of {kbid} failed"))?
        .context("Export task was skipped")?;

    let mut stream = tasks.data().download_export(kbid, &task.task_id).await?;
    let mut file = tokio::fs::File::create(output)
        .await
        .with_context(|| format!("Failed to create {}", output.display()))?;
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    tasks.data().delete_export(kbid, &task.task_id).await?;
    Ok(stats)
}

/// Import the export file at `input` into `kbid` through a tracked task.
pub async fn import_from_file(ctx: &AppContext, kbid: &str, input: &Path) -> Result<ImportStats> {
    let file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("Failed to open {}", input.display()))?;
    let stream = ReaderStream::new(file)
        .map_ok(|chunk| chunk.to_vec())
        .map_err(StorageError::from)
        .boxed();

    let tasks = ctx.export_tasks();
    let task = tasks.start_import(kbid, stream).await?;
    let stats = tasks
        .run_import(task)
        .await
        .with_context(|| format!("Import into {kbid} failed"))?
        .context("Import task was skipped")?;
    Ok(stats)
}

pub async fn run_export(
    config_path: Option<&str>,
    log_level: Option<&str>,
    kbid: &str,
    output: &Path,
) -> Result<()> {
    let settings = load_settings(config_path, log_level)?;
    init_logging(&settings.log_level)?;
    let ctx = AppContext::build(settings)?;
    let stats = export_to_file(&ctx, kbid, output).await?;
    println!(
        "Exported {} resources and {} binaries ({} bytes) to {}",
        stats.resources,
        stats.binaries,
        stats.bytes,
        output.display()
    );
    Ok(())
}

pub async fn run_import(
    config_path: Option<&str>,
    log_level: Option<&str>,
    kbid: &str,
    input: &Path,
) -> Result<()> {
    let settings = load_settings(config_path, log_level)?;
    init_logging(&settings.log_level)?;
    let ctx = AppContext::build(settings)?;
    let stats = import_from_file(&ctx, kbid, input).await?;
    println!(
        "Imported {} resources and {} binaries into {}",
        stats.resources, stats.binaries, kbid
    );
    Ok(())
}
