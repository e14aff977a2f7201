//! Configuration management for the backup daemon.
//!
//! The configuration directory holds `backup-config.json`, which is created
//! with defaults on first start. Values can be overridden from the
//! environment with the `USB_BACKUP_` prefix, `__` separating nested keys
//! (e.g. `USB_BACKUP_LOG__LEVEL=debug`).

use crate::backup::progress::PROGRESS_FILE_NAME;
use crate::binding::{Ownership, SourceBinding};
use crate::utils::errors::{BackupError, Result};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration document inside the configuration directory
pub const CONFIG_FILE_NAME: &str = "backup-config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory the configuration was loaded from
    #[serde(skip)]
    pub config_dir: PathBuf,

    /// Backup tasks, one per source directory
    #[serde(default)]
    pub backup_configs: Vec<BackupTask>,

    /// Progress file location (default: `<config_dir>/.backup-progress`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_file: Option<PathBuf>,

    /// Seconds between checks of each source directory
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub zip_config: ArchiveConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupTask {
    /// Directory to back up
    pub source_dir: PathBuf,

    /// Directory receiving the mirrored content
    pub target_dir: PathBuf,

    /// Owner for copied files, as "uid:gid"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Seconds between archive runs (0 disables archiving)
    #[serde(default)]
    pub interval_seconds: u64,

    #[serde(default)]
    pub items: Vec<ArchiveItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveItem {
    /// File or directory to archive
    pub source: PathBuf,

    /// Zip file to write
    pub target: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_poll_interval_secs() -> u64 {
    crate::monitor::DEFAULT_POLL_INTERVAL.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::new(),
            backup_configs: Vec::new(),
            progress_file: None,
            poll_interval_secs: default_poll_interval_secs(),
            zip_config: ArchiveConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load `backup-config.json` from `config_dir`, writing a default
    /// document first if none exists.
    pub fn load(config_dir: &Path) -> Result<Self> {
        fs::create_dir_all(config_dir)?;

        let path = config_dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            let default = Config {
                config_dir: config_dir.to_path_buf(),
                ..Config::default()
            };
            default.save()?;
            tracing::info!(path = %path.display(), "Created default configuration");
        }

        let mut config: Config = config::Config::builder()
            .add_source(File::from(path.as_path()).format(FileFormat::Json))
            .add_source(
                Environment::with_prefix("USB_BACKUP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.config_dir = config_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Write the document back into the configuration directory
    pub fn save(&self) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(self.config_dir.join(CONFIG_FILE_NAME), data)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(BackupError::Config(
                "poll_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn progress_path(&self) -> PathBuf {
        self.progress_file
            .clone()
            .unwrap_or_else(|| self.config_dir.join(PROGRESS_FILE_NAME))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Validate every task. Invalid tasks and repeated source directories
    /// are returned as errors in place so the caller can report them.
    pub fn bindings(&self) -> Vec<Result<SourceBinding>> {
        let mut seen = HashSet::new();

        self.backup_configs
            .iter()
            .map(|task| {
                let binding = task.to_binding()?;
                if !seen.insert(binding.source().to_path_buf()) {
                    return Err(BackupError::InvalidBinding(format!(
                        "duplicate source directory {}",
                        binding.source().display()
                    )));
                }
                Ok(binding)
            })
            .collect()
    }
}

impl BackupTask {
    pub fn to_binding(&self) -> Result<SourceBinding> {
        let owner = match self.target_user.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(owner) => Some(owner.parse::<Ownership>()?),
        };
        SourceBinding::new(&self.source_dir, &self.target_dir, owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_document_is_created() -> Result<()> {
        let temp = TempDir::new()?;
        let dir = temp.path().join("conf");

        let config = Config::load(&dir)?;

        assert!(dir.join(CONFIG_FILE_NAME).exists());
        assert!(config.backup_configs.is_empty());
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.progress_path(), dir.join(PROGRESS_FILE_NAME));
        assert_eq!(config.zip_config.interval_seconds, 0);
        assert_eq!(config.log.level, "info");
        Ok(())
    }

    #[test]
    fn test_load_document() -> Result<()> {
        let temp = TempDir::new()?;
        fs::write(
            temp.path().join(CONFIG_FILE_NAME),
            r#"{
                "backup_configs": [
                    {"source_dir": "/media/usb", "target_dir": "/backup/usb", "target_user": "1000:1000"},
                    {"source_dir": "/media/sd", "target_dir": "/backup/sd"}
                ],
                "progress_file": "/var/lib/usb-backup/progress.json",
                "zip_config": {
                    "interval_seconds": 3600,
                    "items": [{"source": "/backup/usb", "target": "/archive/usb.zip"}]
                }
            }"#,
        )?;

        let config = Config::load(temp.path())?;
        assert_eq!(config.backup_configs.len(), 2);
        assert_eq!(
            config.progress_path(),
            PathBuf::from("/var/lib/usb-backup/progress.json")
        );
        assert_eq!(config.zip_config.items.len(), 1);

        let bindings: Vec<_> = config.bindings().into_iter().collect::<Result<_>>()?;
        assert_eq!(bindings[0].owner(), Some(Ownership { uid: 1000, gid: 1000 }));
        assert_eq!(bindings[1].owner(), None);
        assert_eq!(bindings[1].target(), Path::new("/backup/sd"));
        Ok(())
    }

    #[test]
    fn test_invalid_tasks_are_reported_individually() -> Result<()> {
        let config = Config {
            backup_configs: vec![
                BackupTask {
                    source_dir: "/media/a".into(),
                    target_dir: "/backup/a".into(),
                    target_user: Some(" ".into()),
                },
                BackupTask {
                    source_dir: "".into(),
                    target_dir: "/backup/b".into(),
                    target_user: None,
                },
                BackupTask {
                    source_dir: "/media/c".into(),
                    target_dir: "/backup/c".into(),
                    target_user: Some("nobody".into()),
                },
                BackupTask {
                    source_dir: "/media/a".into(),
                    target_dir: "/backup/other".into(),
                    target_user: None,
                },
            ],
            ..Config::default()
        };

        let bindings = config.bindings();
        assert!(bindings[0].as_ref().is_ok_and(|b| b.owner().is_none()));
        assert!(matches!(bindings[1], Err(BackupError::InvalidBinding(_))));
        assert!(matches!(bindings[2], Err(BackupError::InvalidOwner(_))));
        assert!(matches!(bindings[3], Err(BackupError::InvalidBinding(_))));
        Ok(())
    }

    #[test]
    fn test_zero_poll_interval_rejected() -> Result<()> {
        let temp = TempDir::new()?;
        fs::write(
            temp.path().join(CONFIG_FILE_NAME),
            r#"{"backup_configs": [], "poll_interval_secs": 0}"#,
        )?;

        assert!(matches!(Config::load(temp.path()), Err(BackupError::Config(_))));
        Ok(())
    }
}
