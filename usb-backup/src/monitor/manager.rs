//! Owns one monitor per configured source directory.

use super::{DirectoryMonitor, MonitorStatus};
use crate::backup::progress::ProgressStore;
use crate::binding::SourceBinding;
use crate::utils::errors::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct WatcherManager {
    progress: Arc<ProgressStore>,
    poll_interval: Duration,
    monitors: Mutex<BTreeMap<PathBuf, Arc<DirectoryMonitor>>>,
}

impl WatcherManager {
    pub fn new(progress: Arc<ProgressStore>, poll_interval: Duration) -> Self {
        Self {
            progress,
            poll_interval,
            monitors: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create and start a monitor for `binding`.
    ///
    /// Returns `Ok(false)` when the source directory is already monitored.
    pub fn add(&self, binding: SourceBinding) -> Result<bool> {
        let mut monitors = self.monitors.lock();
        if monitors.contains_key(binding.source()) {
            return Ok(false);
        }

        let source = binding.source().to_path_buf();
        let monitor = DirectoryMonitor::new(binding, self.progress.clone(), self.poll_interval);
        monitor.start()?;

        monitors.insert(source.clone(), Arc::new(monitor));
        info!(source = %source.display(), "Added directory monitor");
        Ok(true)
    }

    /// Stop and drop the monitor for `source`. Returns whether one existed.
    pub fn remove(&self, source: &Path) -> Result<bool> {
        let removed = self.monitors.lock().remove(source);
        match removed {
            Some(monitor) => {
                monitor.stop()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get(&self, source: &Path) -> Option<Arc<DirectoryMonitor>> {
        self.monitors.lock().get(source).cloned()
    }

    pub fn len(&self) -> usize {
        self.monitors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.lock().is_empty()
    }

    /// Status snapshot of every monitor, ordered by source path
    pub fn statuses(&self) -> Vec<(PathBuf, MonitorStatus)> {
        self.monitors
            .lock()
            .iter()
            .map(|(source, monitor)| (source.clone(), monitor.status()))
            .collect()
    }

    /// Stop every monitor and forget it
    pub fn stop_all(&self) -> Vec<Arc<DirectoryMonitor>> {
        let monitors = std::mem::take(&mut *self.monitors.lock());

        monitors
            .into_iter()
            .map(|(source, monitor)| {
                if let Err(e) = monitor.stop() {
                    warn!(source = %source.display(), "Failed to stop monitor: {}", e);
                }
                monitor
            })
            .collect()
    }

    /// Wait until no file backup of any monitored binding is executing
    pub async fn wait_for_idle(&self) {
        let monitors: Vec<_> = self.monitors.lock().values().cloned().collect();
        for monitor in monitors {
            monitor.wait_for_idle().await;
        }
    }

    /// Stop every monitor, then wait up to `grace` for in-flight file
    /// backups to drain. Returns whether everything drained in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let stopped = self.stop_all();

        let drain = async {
            for monitor in &stopped {
                monitor.wait_for_idle().await;
            }
        };

        match tokio::time::timeout(grace, drain).await {
            Ok(()) => true,
            Err(_) => {
                warn!("Timed out waiting for in-flight backups to finish");
                false
            }
        }
    }
}
