//! File metadata mirroring for backup operations.
//!
//! Copies permission bits and modification times from a source entry onto
//! its mirrored target, and applies the configured owner.

use crate::binding::Ownership;
use filetime::FileTime;
use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// The subset of source metadata that is carried over to the target
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// Last modified time
    pub modified: SystemTime,

    /// File permissions (Unix mode bits)
    pub permissions: Option<u32>,

    /// Is this a regular file (after following symlinks)?
    pub is_file: bool,
}

impl FileMetadata {
    /// Extract metadata from a path, following symlinks
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self::from_std(&metadata))
    }

    pub fn from_std(metadata: &fs::Metadata) -> Self {
        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let permissions = None;

        Self {
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            permissions,
            is_file: metadata.is_file(),
        }
    }

    /// Apply permission bits to a path
    #[cfg(unix)]
    pub fn apply_permissions(&self, path: &Path) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(mode) = self.permissions {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn apply_permissions(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    /// Set both access and modification time of `path` to this entry's
    /// modification time
    pub fn apply_times(&self, path: &Path) -> io::Result<()> {
        let mtime = FileTime::from_system_time(self.modified);
        filetime::set_file_times(path, mtime, mtime)
    }
}

/// Create a single directory carrying the given permission bits
#[cfg(unix)]
pub fn create_dir_with_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    let mut builder = fs::DirBuilder::new();
    if let Some(mode) = mode {
        builder.mode(mode & 0o7777);
    }
    builder.create(path)
}

#[cfg(not(unix))]
pub fn create_dir_with_mode(path: &Path, _mode: Option<u32>) -> io::Result<()> {
    fs::create_dir(path)
}

/// Change the owner of a path
#[cfg(unix)]
pub fn apply_owner(path: &Path, owner: Ownership) -> io::Result<()> {
    use nix::unistd::{chown, Gid, Uid};

    chown(path, Some(Uid::from_raw(owner.uid)), Some(Gid::from_raw(owner.gid)))
        .map_err(io::Error::from)
}

#[cfg(not(unix))]
pub fn apply_owner(_path: &Path, _owner: Ownership) -> io::Result<()> {
    Ok(())
}

/// True when the directory has no entries
pub fn is_dir_empty(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}
