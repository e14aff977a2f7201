//! Full-tree scan of one source directory.
//!
//! Mirrors the directory structure into the target, runs the backup engine
//! for every file, prunes mirrored directories that end up empty and advances
//! the progress record when the walk completes.

use super::engine::BackupEngine;
use super::FileOutcome;
use crate::fs::metadata::{create_dir_with_mode, is_dir_empty, FileMetadata};
use crate::fs::walker::{walk_post_order, TreeVisitor, Visit};
use crate::monitor::MonitorStatus;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use walkdir::DirEntry;

/// Per-scan file counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanCounters {
    pub total_files: u64,
    pub success_files: u64,
    pub failed_files: u64,
    pub skipped_files: u64,
}

impl ScanCounters {
    pub fn record(&mut self, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::Success => self.success_files += 1,
            FileOutcome::Skipped(_) => self.skipped_files += 1,
            FileOutcome::Failed(_) => self.failed_files += 1,
        }
    }
}

/// Result of one scan
#[derive(Debug)]
pub struct ScanReport {
    pub counters: ScanCounters,

    /// Time recorded as the new last sync; `None` when the scan failed
    pub synced_at: Option<DateTime<Utc>>,

    /// The error that aborted the walk
    pub error: Option<BackupError>,
}

impl ScanReport {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone)]
pub struct ScanOrchestrator {
    engine: Arc<BackupEngine>,
    status: Arc<RwLock<MonitorStatus>>,
}

impl ScanOrchestrator {
    pub fn new(engine: Arc<BackupEngine>, status: Arc<RwLock<MonitorStatus>>) -> Self {
        Self { engine, status }
    }

    pub fn engine(&self) -> &Arc<BackupEngine> {
        &self.engine
    }

    /// Scan the whole source tree. Blocking; run it off the async runtime.
    ///
    /// `is_backing_up` is cleared when this returns, whatever the outcome.
    pub fn scan(&self) -> ScanReport {
        let _backing_up = BackingUpGuard {
            status: &self.status,
        };
        let started = Instant::now();
        let binding = self.engine.binding();

        self.status.write().counters = ScanCounters::default();
        info!(
            source = %binding.source().display(),
            target = %binding.target().display(),
            "Starting scan"
        );

        let walked = self.walk();
        let counters = self.status.read().counters;
        let elapsed = started.elapsed();

        match walked {
            Ok(()) => {
                let now = Utc::now();
                let progress = self.engine.progress();
                progress.upsert(
                    &binding.key(),
                    &binding.target().to_string_lossy(),
                    now,
                );
                if let Err(e) = progress.save() {
                    warn!(path = %progress.path().display(), "Failed to save progress: {}", e);
                }

                {
                    let mut status = self.status.write();
                    status.last_sync = Some(now);
                    status.last_error = None;
                }

                info!(
                    source = %binding.source().display(),
                    total = counters.total_files,
                    success = counters.success_files,
                    skipped = counters.skipped_files,
                    failed = counters.failed_files,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Scan completed"
                );

                ScanReport {
                    counters,
                    synced_at: Some(now),
                    error: None,
                }
            }
            Err(e) => {
                self.status.write().last_error = Some(e.to_string());

                error!(
                    source = %binding.source().display(),
                    total = counters.total_files,
                    success = counters.success_files,
                    skipped = counters.skipped_files,
                    failed = counters.failed_files,
                    "Scan aborted: {}", e
                );

                ScanReport {
                    counters,
                    synced_at: None,
                    error: Some(e),
                }
            }
        }
    }

    fn walk(&self) -> Result<()> {
        let binding = self.engine.binding();

        fs::create_dir_all(binding.target()).map_err(|source| BackupError::DirectoryCreation {
            path: binding.target().to_path_buf(),
            source,
        })?;

        let mut visitor = ScanVisitor {
            engine: &self.engine,
            status: &self.status,
        };
        walk_post_order(binding.source(), &mut visitor)?;

        // An unplugged volume makes the remaining entries vanish silently
        if !binding.source().is_dir() {
            return Err(BackupError::SourceVanished(binding.source().to_path_buf()));
        }
        Ok(())
    }
}

struct BackingUpGuard<'a> {
    status: &'a RwLock<MonitorStatus>,
}

impl Drop for BackingUpGuard<'_> {
    fn drop(&mut self) {
        self.status.write().is_backing_up = false;
    }
}

/// Target-side state of a directory between entering and leaving it
struct MirroredDir {
    target: PathBuf,
    metadata: FileMetadata,
    created: bool,
}

struct ScanVisitor<'a> {
    engine: &'a BackupEngine,
    status: &'a RwLock<MonitorStatus>,
}

impl TreeVisitor for ScanVisitor<'_> {
    type Dir = MirroredDir;

    fn enter_dir(&mut self, entry: &DirEntry) -> Result<Visit<MirroredDir>> {
        let binding = self.engine.binding();

        // Target nested inside the source must not be mirrored into itself
        if entry.path() == binding.target() {
            debug!(path = %entry.path().display(), "Skipping target directory inside source");
            return Ok(Visit::SkipSubtree);
        }

        let target = binding.target_for(entry.path())?;
        let metadata = FileMetadata::from_path(entry.path())?;

        let created = match fs::symlink_metadata(&target) {
            Ok(existing) if existing.is_dir() => false,
            Ok(_) => return Err(BackupError::NotADirectory(target)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                create_dir_with_mode(&target, metadata.permissions).map_err(|source| {
                    BackupError::DirectoryCreation {
                        path: target.clone(),
                        source,
                    }
                })?;
                true
            }
            Err(source) => {
                return Err(BackupError::DirectoryCreation {
                    path: target,
                    source,
                })
            }
        };

        Ok(Visit::Descend(MirroredDir {
            target,
            metadata,
            created,
        }))
    }

    fn leave_dir(&mut self, entry: &DirEntry, dir: MirroredDir) -> Result<()> {
        if dir.created {
            match is_dir_empty(&dir.target) {
                Ok(true) => {
                    debug!(target = %dir.target.display(), "Removing empty mirrored directory");
                    if let Err(e) = fs::remove_dir(&dir.target) {
                        warn!(target = %dir.target.display(), "Failed to remove empty directory: {}", e);
                    }
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(target = %dir.target.display(), "Failed to list mirrored directory: {}", e);
                }
            }
        }

        if let Err(e) = dir.metadata.apply_times(&dir.target) {
            warn!(
                source = %entry.path().display(),
                target = %dir.target.display(),
                "Failed to set directory times: {}", e
            );
        }
        Ok(())
    }

    fn visit_file(&mut self, entry: &DirEntry) -> Result<()> {
        self.status.write().counters.total_files += 1;
        let outcome = self.engine.backup(entry.path());
        self.status.write().counters.record(&outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::progress::{ProgressStore, PROGRESS_FILE_NAME};
    use crate::binding::SourceBinding;
    use filetime::FileTime;
    use std::path::Path;
    use std::time::SystemTime;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        src: PathBuf,
        dst: PathBuf,
        scanner: ScanOrchestrator,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let src = temp.path().join("src");
            let dst = temp.path().join("dst");
            fs::create_dir(&src).unwrap();
            let scanner = Self::scanner_for(temp.path(), &src, &dst);
            Self {
                temp,
                src,
                dst,
                scanner,
            }
        }

        fn scanner_for(root: &Path, src: &Path, dst: &Path) -> ScanOrchestrator {
            let progress = Arc::new(ProgressStore::load(root.join(PROGRESS_FILE_NAME)).unwrap());
            let engine = Arc::new(BackupEngine::new(
                SourceBinding::new(src, dst, None).unwrap(),
                progress,
            ));
            ScanOrchestrator::new(engine, Arc::new(RwLock::new(MonitorStatus::default())))
        }

        fn status(&self) -> MonitorStatus {
            self.scanner.status.read().clone()
        }
    }

    #[test]
    fn test_first_scan_copies_second_scan_skips() {
        let f = Fixture::new();
        fs::write(f.src.join("a.txt"), b"x").unwrap();

        let first = f.scanner.scan();
        assert!(first.is_complete());
        assert_eq!(
            first.counters,
            ScanCounters {
                total_files: 1,
                success_files: 1,
                failed_files: 0,
                skipped_files: 0,
            }
        );
        assert_eq!(fs::read(f.dst.join("a.txt")).unwrap(), b"x");

        let second = f.scanner.scan();
        assert!(second.is_complete());
        assert_eq!(
            second.counters,
            ScanCounters {
                total_files: 1,
                success_files: 0,
                failed_files: 0,
                skipped_files: 1,
            }
        );
        assert_eq!(f.status().counters, second.counters);
    }

    #[test]
    fn test_content_change_without_mtime_change_is_skipped() {
        let f = Fixture::new();
        let file = f.src.join("a.txt");
        fs::write(&file, b"x").unwrap();
        let mtime = FileTime::from_last_modification_time(&fs::metadata(&file).unwrap());

        assert_eq!(f.scanner.scan().counters.success_files, 1);

        fs::write(&file, b"changed").unwrap();
        filetime::set_file_mtime(&file, mtime).unwrap();

        let report = f.scanner.scan();
        assert_eq!(report.counters.skipped_files, 1);
        assert_eq!(report.counters.success_files, 0);
        assert_eq!(fs::read(f.dst.join("a.txt")).unwrap(), b"x");
    }

    #[test]
    fn test_deleted_source_file_keeps_target() {
        let f = Fixture::new();
        fs::write(f.src.join("keep.txt"), b"keep").unwrap();
        fs::create_dir(f.src.join("sub")).unwrap();
        fs::write(f.src.join("sub/nested.txt"), b"nested").unwrap();
        assert_eq!(f.scanner.scan().counters.success_files, 2);

        fs::remove_file(f.src.join("keep.txt")).unwrap();
        fs::remove_dir_all(f.src.join("sub")).unwrap();
        let report = f.scanner.scan();

        assert!(report.is_complete());
        assert_eq!(report.counters.total_files, 0);
        assert_eq!(fs::read(f.dst.join("keep.txt")).unwrap(), b"keep");
        assert_eq!(fs::read(f.dst.join("sub/nested.txt")).unwrap(), b"nested");
    }

    #[test]
    fn test_empty_subtrees_are_pruned() {
        let f = Fixture::new();
        fs::create_dir_all(f.src.join("empty/deeper/deepest")).unwrap();
        fs::create_dir_all(f.src.join("full/inner")).unwrap();
        fs::write(f.src.join("full/inner/a.txt"), b"a").unwrap();

        let report = f.scanner.scan();
        assert!(report.is_complete());
        assert!(!f.dst.join("empty").exists());
        assert!(f.dst.join("full/inner/a.txt").exists());
    }

    #[test]
    fn test_directories_of_skipped_files_are_pruned() {
        let f = Fixture::new();
        fs::create_dir(f.src.join("old")).unwrap();
        let file = f.src.join("old/a.txt");
        fs::write(&file, b"a").unwrap();
        filetime::set_file_mtime(
            &file,
            FileTime::from_system_time(SystemTime::now() - std::time::Duration::from_secs(3600)),
        )
        .unwrap();
        f.scanner
            .engine()
            .progress()
            .upsert(&f.scanner.engine().binding().key(), "", Utc::now());

        let report = f.scanner.scan();
        assert_eq!(report.counters.skipped_files, 1);
        assert!(!f.dst.join("old").exists());
    }

    #[test]
    fn test_existing_empty_target_directory_is_kept() {
        let f = Fixture::new();
        fs::create_dir(f.src.join("keep")).unwrap();
        fs::create_dir_all(f.dst.join("keep")).unwrap();

        f.scanner.scan();
        assert!(f.dst.join("keep").is_dir());
    }

    #[test]
    fn test_directory_times_follow_source() {
        let f = Fixture::new();
        let dir = f.src.join("photos");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("a.jpg"), b"jpg").unwrap();
        let past = FileTime::from_system_time(
            SystemTime::now() - std::time::Duration::from_secs(86_400),
        );
        filetime::set_file_mtime(&dir, past).unwrap();

        f.scanner.scan();

        let target_meta = fs::metadata(f.dst.join("photos")).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&target_meta), past);
    }

    #[test]
    fn test_file_mtime_is_mirrored() {
        let f = Fixture::new();
        let file = f.src.join("a.txt");
        fs::write(&file, b"x").unwrap();
        let source_mtime = FileTime::from_last_modification_time(&fs::metadata(&file).unwrap());

        f.scanner.scan();

        let target_meta = fs::metadata(f.dst.join("a.txt")).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&target_meta), source_mtime);
    }

    #[test]
    fn test_completed_scan_advances_progress() {
        let f = Fixture::new();
        let before = Utc::now();

        let report = f.scanner.scan();
        let synced = report.synced_at.unwrap();
        assert!(synced >= before);

        let store = ProgressStore::load(f.temp.path().join(PROGRESS_FILE_NAME)).unwrap();
        assert_eq!(store.last_sync(&f.src.to_string_lossy()), Some(synced));
        assert_eq!(f.status().last_sync, Some(synced));
        assert!(!f.status().is_backing_up);

        let again = f.scanner.scan();
        assert!(again.synced_at.unwrap() >= synced);
    }

    #[test]
    fn test_fatal_error_does_not_advance_progress() {
        let f = Fixture::new();
        fs::create_dir(f.src.join("a")).unwrap();
        fs::write(f.src.join("a/x.txt"), b"x").unwrap();
        fs::create_dir(f.src.join("b")).unwrap();
        fs::write(f.src.join("b/y.txt"), b"y").unwrap();
        fs::write(f.src.join("z.txt"), b"z").unwrap();
        fs::create_dir(&f.dst).unwrap();
        // A file where the mirrored directory must go
        fs::write(f.dst.join("a"), b"blocker").unwrap();

        f.scanner.status.write().is_backing_up = true;
        let report = f.scanner.scan();

        assert!(matches!(report.error, Some(BackupError::NotADirectory(_))));
        assert!(report.synced_at.is_none());

        // Only the blocked subtree is abandoned
        assert_eq!(fs::read(f.dst.join("b/y.txt")).unwrap(), b"y");
        assert_eq!(fs::read(f.dst.join("z.txt")).unwrap(), b"z");
        assert_eq!(fs::read(f.dst.join("a")).unwrap(), b"blocker");
        assert_eq!(report.counters.total_files, 2);
        assert_eq!(report.counters.success_files, 2);
        assert_eq!(f.scanner.engine().progress().last_sync(&f.src.to_string_lossy()), None);

        let status = f.status();
        assert!(!status.is_backing_up);
        assert!(status.last_error.is_some());
        assert_eq!(status.last_sync, None);
    }

    #[test]
    fn test_existing_target_entry_is_skipped() {
        let f = Fixture::new();
        fs::write(f.src.join("a.txt"), b"a").unwrap();
        fs::write(f.src.join("b.txt"), b"b").unwrap();
        fs::create_dir_all(f.dst.join("a.txt")).unwrap();

        let report = f.scanner.scan();
        assert!(report.is_complete());
        assert_eq!(report.counters.total_files, 2);
        assert_eq!(report.counters.skipped_files, 1);
        assert_eq!(report.counters.success_files, 1);
    }

    #[test]
    #[cfg(unix)]
    fn test_per_file_failure_does_not_abort_scan() {
        let f = Fixture::new();
        fs::write(f.src.join("a.txt"), b"a").unwrap();
        fs::create_dir(f.src.join("realdir")).unwrap();
        fs::write(f.src.join("realdir/c.txt"), b"c").unwrap();
        // Symlinked directories are not followed and cannot be copied as files
        std::os::unix::fs::symlink(f.src.join("realdir"), f.src.join("link")).unwrap();

        let report = f.scanner.scan();
        assert!(report.is_complete());
        assert_eq!(
            report.counters,
            ScanCounters {
                total_files: 3,
                success_files: 2,
                failed_files: 1,
                skipped_files: 0,
            }
        );
        assert!(f.dst.join("realdir/c.txt").exists());
        assert!(!f.dst.join("link").exists());
    }

    #[test]
    fn test_missing_source_root_is_fatal() {
        let temp = TempDir::new().unwrap();
        let scanner = Fixture::scanner_for(
            temp.path(),
            &temp.path().join("absent"),
            &temp.path().join("dst"),
        );

        let report = scanner.scan();
        assert!(!report.is_complete());
        assert!(report.synced_at.is_none());
    }

    #[test]
    fn test_target_nested_in_source_is_not_mirrored() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = src.join("backup");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("a.txt"), b"a").unwrap();
        let scanner = Fixture::scanner_for(temp.path(), &src, &dst);

        let report = scanner.scan();
        assert!(report.is_complete());
        assert_eq!(report.counters.total_files, 1);
        assert!(dst.join("a.txt").exists());
        assert!(!dst.join("backup").exists());
    }
}
