//! Incremental backup: per-file decisions, tree scans and the progress record.

pub mod engine;
pub mod progress;
pub mod scan;

pub use engine::BackupEngine;
pub use progress::{ProgressRecord, ProgressStore};
pub use scan::{ScanCounters, ScanOrchestrator, ScanReport};

use crate::utils::errors::BackupError;
use std::fmt;

/// Why a file needed no copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Modified before the last completed scan of its source
    OlderThanLastSync,

    /// A file already exists at the mirrored target path
    TargetExists,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::OlderThanLastSync => f.write_str("unchanged since last sync"),
            SkipReason::TargetExists => f.write_str("target already exists"),
        }
    }
}

/// Result of one backup decision
#[derive(Debug)]
pub enum FileOutcome {
    Success,
    Skipped(SkipReason),
    Failed(BackupError),
}

impl FileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FileOutcome::Success)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, FileOutcome::Failed(_))
    }
}
