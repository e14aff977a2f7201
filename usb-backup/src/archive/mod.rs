//! Periodic zip archives of configured files and directories.

use crate::config::{ArchiveConfig, ArchiveItem};
use crate::utils::errors::{BackupError, Result};
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub struct ArchiveScheduler;

impl ArchiveScheduler {
    /// Spawn the archive loop. Returns `None` when archiving is disabled
    /// (zero interval or no items).
    pub fn start(config: ArchiveConfig, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if config.interval_seconds == 0 || config.items.is_empty() {
            debug!("Archiving disabled");
            return None;
        }

        let period = Duration::from_secs(config.interval_seconds);
        info!(
            items = config.items.len(),
            interval_secs = config.interval_seconds,
            "Starting archive scheduler"
        );

        Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => run_once(&config.items).await,
                }
            }
            info!("Archive scheduler stopped");
        }))
    }
}

async fn run_once(items: &[ArchiveItem]) {
    for item in items {
        let job = item.clone();
        match tokio::task::spawn_blocking(move || archive_item(&job)).await {
            Ok(Ok(entries)) => info!(
                source = %item.source.display(),
                target = %item.target.display(),
                entries,
                "Archive written"
            ),
            Ok(Err(BackupError::Io(e))) if e.kind() == io::ErrorKind::NotFound => {
                warn!(source = %item.source.display(), "Archive source missing, skipped")
            }
            Ok(Err(e)) => error!(
                source = %item.source.display(),
                target = %item.target.display(),
                "Archive failed: {}",
                e
            ),
            Err(e) => error!(source = %item.source.display(), "Archive task panicked: {}", e),
        }
    }
}

/// Write `item.source` into the zip file `item.target`, replacing it.
///
/// Returns the number of file entries written. A missing source fails
/// with `NotFound` before the target is touched.
pub fn archive_item(item: &ArchiveItem) -> Result<usize> {
    let source_meta = fs::metadata(&item.source)?;

    if let Some(parent) = item.target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let partial = partial_path(&item.target);
    let written = write_archive(&item.source, source_meta.is_dir(), &partial);
    match written {
        Ok(entries) => {
            fs::rename(&partial, &item.target)?;
            Ok(entries)
        }
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(&partial) {
                debug!(path = %partial.display(), "Could not remove partial archive: {}", cleanup);
            }
            Err(e)
        }
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    target.with_file_name(name)
}

fn write_archive(source: &Path, is_dir: bool, dest: &Path) -> Result<usize> {
    let mut zip = ZipWriter::new(BufWriter::new(File::create(dest)?));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut entries = 0;
    if is_dir {
        for entry in WalkDir::new(source).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|_| BackupError::OutsideRoot {
                    path: entry.path().to_path_buf(),
                    root: source.to_path_buf(),
                })?;
            add_file(&mut zip, entry.path(), &entry_name(relative), options)?;
            entries += 1;
        }
    } else {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        add_file(&mut zip, source, &name, options)?;
        entries += 1;
    }

    zip.finish()?.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(entries)
}

fn add_file<W: io::Write + io::Seek>(
    zip: &mut ZipWriter<W>,
    path: &Path,
    name: &str,
    options: SimpleFileOptions,
) -> Result<()> {
    zip.start_file(name, options)?;
    io::copy(&mut File::open(path)?, zip)?;
    Ok(())
}

/// Zip entry names always use `/`
fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
