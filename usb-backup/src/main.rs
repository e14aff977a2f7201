//! USB Backup - Main entry point
//!
//! Watches configured source directories and mirrors them into their
//! targets whenever they appear.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use usb_backup::archive::ArchiveScheduler;
use usb_backup::backup::ProgressStore;
use usb_backup::config::Config;
use usb_backup::daemon::ShutdownCoordinator;
use usb_backup::monitor::WatcherManager;
use usb_backup::utils;

/// Time allowed for in-flight file backups to finish at shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for blocking scan and archive tasks once the runtime stops
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding backup-config.json
    #[arg(short, long, value_name = "DIR", env = "BACKUP_CONFIG_DIR")]
    config_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    // Missing .env is fine
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    let result = runtime.block_on(run(args));

    // Scans are never interrupted mid-walk; do not let one hold the process.
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    result
}

async fn run(args: Args) -> Result<()> {
    // Load configuration
    let config = Config::load(&args.config_dir).with_context(|| {
        format!(
            "Failed to load configuration from {}",
            args.config_dir.display()
        )
    })?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting usb-backup v{} (config: {})",
        env!("CARGO_PKG_VERSION"),
        config.config_dir.display()
    );

    let progress_path = config.progress_path();
    let progress = Arc::new(
        ProgressStore::load(&progress_path)
            .with_context(|| format!("Failed to load progress file {}", progress_path.display()))?,
    );
    tracing::info!(
        path = %progress_path.display(),
        records = progress.records().len(),
        "Progress loaded"
    );

    let manager = WatcherManager::new(progress, config.poll_interval());

    for (task, binding) in config.backup_configs.iter().zip(config.bindings()) {
        let added = binding.and_then(|binding| manager.add(binding));
        match added {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                source = %task.source_dir.display(),
                "Source directory already monitored, task ignored"
            ),
            Err(e) => tracing::error!(
                source = %task.source_dir.display(),
                target = %task.target_dir.display(),
                "Backup task rejected: {}",
                e
            ),
        }
    }

    if manager.is_empty() {
        bail!("No valid backup task configured");
    }
    tracing::info!(tasks = manager.len(), "Monitoring started");

    // Create shutdown coordinator
    let shutdown_coordinator = ShutdownCoordinator::new();

    let archive_handle =
        ArchiveScheduler::start(config.zip_config.clone(), shutdown_coordinator.token());

    // Wait for shutdown signal
    shutdown_coordinator.wait_for_signal().await;

    if !manager.shutdown(DRAIN_TIMEOUT).await {
        tracing::warn!("Some file backups were still running at exit");
    }

    if let Some(handle) = archive_handle {
        match tokio::time::timeout(Duration::from_secs(3), handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Archive scheduler panicked: {}", e),
            Err(_) => tracing::warn!("Archive scheduler shutdown timeout"),
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
