//! Per-file skip/copy decision and attribute-preserving copy.

use super::{FileOutcome, SkipReason};
use crate::backup::progress::ProgressStore;
use crate::binding::SourceBinding;
use crate::fs::metadata::{apply_owner, FileMetadata};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Decides, for one discovered source file, whether it must be copied, and
/// copies it. Holds no per-scan state.
pub struct BackupEngine {
    binding: SourceBinding,
    progress: Arc<ProgressStore>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl BackupEngine {
    pub fn new(binding: SourceBinding, progress: Arc<ProgressStore>) -> Self {
        Self {
            binding,
            progress,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn binding(&self) -> &SourceBinding {
        &self.binding
    }

    pub fn progress(&self) -> &Arc<ProgressStore> {
        &self.progress
    }

    /// Back up one file below the binding's source root.
    ///
    /// Skips files modified before the last completed scan and files whose
    /// target already exists; the target's content is never compared.
    pub fn backup(&self, source: &Path) -> FileOutcome {
        let _guard = InFlightGuard::enter(self);

        let target = match self.binding.target_for(source) {
            Ok(target) => target,
            Err(e) => {
                warn!(path = %source.display(), "Cannot map file to target: {}", e);
                return FileOutcome::Failed(e);
            }
        };

        let metadata = match FileMetadata::from_path(source) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = %source.display(), "Failed to stat source file: {}", e);
                return FileOutcome::Failed(e.into());
            }
        };

        if !metadata.is_file {
            warn!(path = %source.display(), "Not a regular file, not backed up");
            return FileOutcome::Failed(BackupError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", source.display()),
            )));
        }

        if let Some(last_sync) = self.progress.last_sync(&self.binding.key()) {
            let modified: DateTime<Utc> = metadata.modified.into();
            if modified < last_sync {
                return skipped(source, SkipReason::OlderThanLastSync);
            }
        }

        match fs::symlink_metadata(&target) {
            Ok(_) => return skipped(source, SkipReason::TargetExists),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(target = %target.display(), "Failed to stat target file: {}", e);
                return FileOutcome::Failed(e.into());
            }
        }

        match self.copy(source, &target, &metadata) {
            Ok(bytes) => {
                debug!(path = %source.display(), target = %target.display(), bytes, "File backed up");
                FileOutcome::Success
            }
            Err(e) => {
                warn!(path = %source.display(), target = %target.display(), "Failed to back up file: {}", e);
                FileOutcome::Failed(e)
            }
        }
    }

    /// Stream the content, then mirror permissions, times and owner.
    /// A partially written target is left in place on failure.
    fn copy(&self, source: &Path, target: &Path, metadata: &FileMetadata) -> Result<u64> {
        let mut src_file = File::open(source)?;
        let mut dst_file = File::create(target)?;

        let bytes = io::copy(&mut src_file, &mut dst_file)?;
        dst_file.sync_all()?;
        drop(dst_file);

        metadata.apply_permissions(target)?;
        if let Some(owner) = self.binding.owner() {
            apply_owner(target, owner)?;
        }
        metadata.apply_times(target)?;

        Ok(bytes)
    }

    /// Number of `backup` calls currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no `backup` call is executing
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn skipped(source: &Path, reason: SkipReason) -> FileOutcome {
    debug!(path = %source.display(), %reason, "Skipping file");
    FileOutcome::Skipped(reason)
}

struct InFlightGuard<'a> {
    engine: &'a BackupEngine,
}

impl<'a> InFlightGuard<'a> {
    fn enter(engine: &'a BackupEngine) -> Self {
        engine.in_flight.fetch_add(1, Ordering::AcqRel);
        Self { engine }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.engine.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.engine.idle.notify_waiters();
        }
    }
}
