//! USB Backup Library
//!
//! Incremental one-way backup of removable volumes: each configured source
//! directory is polled, and every time it appears its content is mirrored
//! into a target directory without ever deleting anything there.

pub mod archive;
pub mod backup;
pub mod binding;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod monitor;
pub mod utils;

// Re-export commonly used types
pub use binding::SourceBinding;
pub use config::Config;
pub use monitor::{DirectoryMonitor, WatcherManager};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
