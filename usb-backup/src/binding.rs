//! Source/target bindings.
//!
//! A binding ties one source directory (usually a mount point of removable
//! media) to the directory its content is mirrored into.

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Owner applied to every file copied for a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl FromStr for Ownership {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        let (uid, gid) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| BackupError::InvalidOwner(s.to_string()))?;

        let uid = uid
            .trim()
            .parse()
            .map_err(|_| BackupError::InvalidOwner(s.to_string()))?;
        let gid = gid
            .trim()
            .parse()
            .map_err(|_| BackupError::InvalidOwner(s.to_string()))?;

        Ok(Self { uid, gid })
    }
}

impl fmt::Display for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// One configured backup task. Immutable once a monitor owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBinding {
    source: PathBuf,
    target: PathBuf,
    owner: Option<Ownership>,
}

impl SourceBinding {
    pub fn new(
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        owner: Option<Ownership>,
    ) -> Result<Self> {
        let source = source.into();
        let target = target.into();

        if source.as_os_str().is_empty() {
            return Err(BackupError::InvalidBinding("source directory is empty".into()));
        }
        if target.as_os_str().is_empty() {
            return Err(BackupError::InvalidBinding("target directory is empty".into()));
        }

        Ok(Self { source, target, owner })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn owner(&self) -> Option<Ownership> {
        self.owner
    }

    /// Key under which progress for this binding is recorded.
    pub fn key(&self) -> String {
        self.source.to_string_lossy().into_owned()
    }

    /// Map a path under the source root onto the mirrored target path,
    /// segment for segment.
    pub fn target_for(&self, path: &Path) -> Result<PathBuf> {
        let relative = path
            .strip_prefix(&self.source)
            .map_err(|_| BackupError::OutsideRoot {
                path: path.to_path_buf(),
                root: self.source.clone(),
            })?;

        Ok(self.target.join(relative))
    }
}
