//! Durable record of the last completed scan per source directory.
//!
//! All bindings share one progress file, so every read-modify-write of the
//! record set goes through a single lock.

use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default file name of the progress file inside the configuration directory
pub const PROGRESS_FILE_NAME: &str = ".backup-progress";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub source_dir: String,

    #[serde(default)]
    pub target_dir: String,

    /// Time the last scan of `source_dir` completed
    pub progress_time: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProgressDocument {
    #[serde(default)]
    backup_configs: Vec<ProgressRecord>,
}

#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    document: Mutex<ProgressDocument>,
}

impl ProgressStore {
    /// Load the progress file. A missing or blank file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let document = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => ProgressDocument::default(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No progress file yet, nothing synced");
                ProgressDocument::default()
            }
            Err(e) => return Err(e.into()),
        };

        debug!(
            path = %path.display(),
            records = document.backup_configs.len(),
            "Loaded progress file"
        );

        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Time of the last completed scan of `source_dir`, if any
    pub fn last_sync(&self, source_dir: &str) -> Option<DateTime<Utc>> {
        self.document
            .lock()
            .backup_configs
            .iter()
            .find(|record| record.source_dir == source_dir)
            .map(|record| record.progress_time)
    }

    /// Update the record for `source_dir` or append a new one.
    ///
    /// An existing time is never moved backwards. Returns whether the stored
    /// time changed.
    pub fn upsert(&self, source_dir: &str, target_dir: &str, time: DateTime<Utc>) -> bool {
        let mut document = self.document.lock();

        match document
            .backup_configs
            .iter_mut()
            .find(|record| record.source_dir == source_dir)
        {
            Some(record) => {
                record.target_dir = target_dir.to_string();
                if time > record.progress_time {
                    record.progress_time = time;
                    true
                } else {
                    false
                }
            }
            None => {
                document.backup_configs.push(ProgressRecord {
                    source_dir: source_dir.to_string(),
                    target_dir: target_dir.to_string(),
                    progress_time: time,
                });
                true
            }
        }
    }

    /// Serialize the full record set and replace the progress file
    pub fn save(&self) -> Result<()> {
        let document = self.document.lock();
        let data = serde_json::to_string_pretty(&*document)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;

        debug!(
            path = %self.path.display(),
            records = document.backup_configs.len(),
            "Saved progress file"
        );
        Ok(())
    }

    /// Snapshot of every record, in file order
    pub fn records(&self) -> Vec<ProgressRecord> {
        self.document.lock().backup_configs.clone()
    }
}
