//! Source directory lifecycle monitoring.
//!
//! Each monitor polls its source path on a fixed interval. A scan starts
//! only when the source turns from absent to present; while it stays
//! present nothing else happens until it disappears and comes back.

pub mod manager;

pub use manager::WatcherManager;

use crate::backup::progress::ProgressStore;
use crate::backup::scan::{ScanCounters, ScanOrchestrator, ScanReport};
use crate::backup::BackupEngine;
use crate::binding::SourceBinding;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Observable state of one monitor
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorStatus {
    pub is_backing_up: bool,
    pub is_last_check_exists: bool,
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub counters: ScanCounters,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Offline,
    Idle,
    Scanning,
}

impl MonitorStatus {
    pub fn state(&self) -> MonitorState {
        if self.is_backing_up {
            MonitorState::Scanning
        } else if self.is_last_check_exists {
            MonitorState::Idle
        } else {
            MonitorState::Offline
        }
    }
}

/// What a single poll observed and did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Source absent, and was already absent
    Offline,
    /// Source was present on the previous poll and is gone now
    WentOffline,
    /// Source became available; a scan was launched
    ScanStarted,
    /// Source present and already scanned or being scanned
    Online,
    /// Stat failed for a reason other than absence
    StatFailed,
}

pub struct DirectoryMonitor {
    inner: Arc<MonitorInner>,
    poll_interval: Duration,
    cancel: Mutex<Option<CancellationToken>>,
}

struct MonitorInner {
    scanner: ScanOrchestrator,
    status: Arc<RwLock<MonitorStatus>>,
    scan_task: Mutex<Option<JoinHandle<ScanReport>>>,
}

impl DirectoryMonitor {
    pub fn new(binding: SourceBinding, progress: Arc<ProgressStore>, poll_interval: Duration) -> Self {
        let status = Arc::new(RwLock::new(MonitorStatus {
            last_sync: progress.last_sync(&binding.key()),
            ..MonitorStatus::default()
        }));
        let engine = Arc::new(BackupEngine::new(binding, progress));

        Self {
            inner: Arc::new(MonitorInner {
                scanner: ScanOrchestrator::new(engine, status.clone()),
                status,
                scan_task: Mutex::new(None),
            }),
            poll_interval,
            cancel: Mutex::new(None),
        }
    }

    pub fn binding(&self) -> &SourceBinding {
        self.inner.scanner.engine().binding()
    }

    /// Start polling in the background. Returns immediately; starting a
    /// running monitor does nothing.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BackupError::Daemon(format!("no async runtime to poll on: {e}")))?;

        let mut cancel = self.cancel.lock();
        if cancel.is_some() {
            debug!(source = %self.binding().source().display(), "Monitor already running");
            return Ok(());
        }

        let token = CancellationToken::new();
        let stopped = token.clone();
        let inner = self.inner.clone();
        let period = self.poll_interval;

        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.poll().await;
                    }
                }
            }
            debug!(source = %inner.scanner.engine().binding().source().display(), "Polling stopped");
        });

        *cancel = Some(token);
        info!(
            source = %self.binding().source().display(),
            target = %self.binding().target().display(),
            interval_ms = period.as_millis() as u64,
            "Monitoring started"
        );
        Ok(())
    }

    /// Stop polling. A running scan is not interrupted but is no longer
    /// tracked. Stopping a stopped monitor does nothing.
    pub fn stop(&self) -> Result<()> {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
            self.inner.scan_task.lock().take();
            info!(source = %self.binding().source().display(), "Monitoring stopped");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.cancel.lock().is_some()
    }

    /// Run one poll tick now
    pub async fn poll(&self) -> PollOutcome {
        self.inner.poll().await
    }

    pub fn status(&self) -> MonitorStatus {
        self.inner.status.read().clone()
    }

    /// Wait for the tracked scan, if any, and return its report
    pub async fn wait_for_scan(&self) -> Option<ScanReport> {
        let handle = self.inner.scan_task.lock().take()?;
        match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(source = %self.binding().source().display(), "Scan task failed: {}", e);
                None
            }
        }
    }

    /// Wait until no file backup of this binding is executing
    pub async fn wait_for_idle(&self) {
        self.inner.scanner.engine().wait_idle().await;
    }
}

impl Drop for DirectoryMonitor {
    fn drop(&mut self) {
        if let Some(token) = self.cancel.get_mut().take() {
            token.cancel();
        }
    }
}

impl MonitorInner {
    async fn poll(&self) -> PollOutcome {
        let source = self.scanner.engine().binding().source();

        let present = match tokio::fs::metadata(source).await {
            Ok(metadata) => metadata.is_dir(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(source = %source.display(), "Failed to check source directory: {}", e);
                self.status.write().last_error = Some(e.to_string());
                return PollOutcome::StatFailed;
            }
        };

        if !present {
            let mut status = self.status.write();
            if status.is_last_check_exists {
                status.is_last_check_exists = false;
                info!(source = %source.display(), "Source directory went offline");
                return PollOutcome::WentOffline;
            }
            return PollOutcome::Offline;
        }

        {
            let mut status = self.status.write();
            if status.is_backing_up || status.is_last_check_exists {
                return PollOutcome::Online;
            }
            status.is_backing_up = true;
            status.is_last_check_exists = true;
        }

        info!(source = %source.display(), "Source directory available, starting scan");
        let scanner = self.scanner.clone();
        let handle = tokio::task::spawn_blocking(move || scanner.scan());
        *self.scan_task.lock() = Some(handle);

        PollOutcome::ScanStarted
    }
}
