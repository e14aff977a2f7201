//! Post-order directory traversal.
//!
//! The walk hands every directory to the visitor twice: once before its
//! children are visited, where the visitor may decline to descend, and once
//! after the whole subtree has been visited. Entries are visited in file name
//! order and the root itself is never handed to the visitor.

use crate::utils::errors::{BackupError, Result};
use std::path::Path;
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Decision returned when entering a directory
#[derive(Debug)]
pub enum Visit<D> {
    /// Walk the subtree, then call `leave_dir` with this state
    Descend(D),

    /// Do not walk the subtree and do not call `leave_dir`
    SkipSubtree,
}

/// Callbacks driven by [`walk_post_order`].
///
/// An `Err` from `enter_dir`, or from anything below that directory, aborts
/// the rest of that subtree only. Siblings are still walked, ancestors still
/// receive `leave_dir`, and the first such error is returned once the walk
/// ends. An `Err` from `visit_file` aborts the rest of the enclosing
/// directory.
pub trait TreeVisitor {
    /// Per-directory state carried from `enter_dir` to `leave_dir`
    type Dir;

    fn enter_dir(&mut self, entry: &DirEntry) -> Result<Visit<Self::Dir>>;

    fn leave_dir(&mut self, entry: &DirEntry, dir: Self::Dir) -> Result<()>;

    /// Called for every non-directory entry (symlinks included)
    fn visit_file(&mut self, entry: &DirEntry) -> Result<()>;

    /// Called for a child entry that could not be read; the entry is skipped
    fn entry_error(&mut self, err: walkdir::Error) {
        warn!("Failed to access {}: {}", display_error_path(&err), err);
    }
}

/// Walk the tree below `root`, children before their parent's `leave_dir`.
///
/// Failing to list a directory is an error; failing to read a single entry
/// is reported to the visitor and skipped.
///
/// # Example
/// ```no_run
/// use usb_backup::fs::walker::{walk_post_order, TreeVisitor, Visit};
/// use walkdir::DirEntry;
///
/// struct Count(usize);
///
/// impl TreeVisitor for Count {
///     type Dir = ();
///     fn enter_dir(&mut self, _: &DirEntry) -> usb_backup::Result<Visit<()>> {
///         Ok(Visit::Descend(()))
///     }
///     fn leave_dir(&mut self, _: &DirEntry, _: ()) -> usb_backup::Result<()> {
///         Ok(())
///     }
///     fn visit_file(&mut self, _: &DirEntry) -> usb_backup::Result<()> {
///         self.0 += 1;
///         Ok(())
///     }
/// }
///
/// let mut count = Count(0);
/// walk_post_order(std::path::Path::new("/data"), &mut count).unwrap();
/// println!("Found {} files", count.0);
/// ```
pub fn walk_post_order<V: TreeVisitor>(root: &Path, visitor: &mut V) -> Result<()> {
    walk_children(root, visitor)
}

fn walk_children<V: TreeVisitor>(dir: &Path, visitor: &mut V) -> Result<()> {
    let children = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    let mut first_error = None;

    for entry in children {
        let entry = match entry {
            Ok(entry) => entry,
            // Depth 0 means `dir` itself could not be listed
            Err(err) if err.depth() == 0 => return Err(BackupError::Walk(err)),
            Err(err) => {
                visitor.entry_error(err);
                continue;
            }
        };

        if entry.file_type().is_dir() {
            if let Err(e) = walk_subtree(&entry, visitor) {
                warn!(path = %entry.path().display(), "Subtree walk aborted: {}", e);
                first_error.get_or_insert(e);
            }
        } else if let Err(e) = visitor.visit_file(&entry) {
            return Err(first_error.unwrap_or(e));
        }
    }

    first_error.map_or(Ok(()), Err)
}

fn walk_subtree<V: TreeVisitor>(entry: &DirEntry, visitor: &mut V) -> Result<()> {
    match visitor.enter_dir(entry)? {
        Visit::Descend(state) => {
            let walked = walk_children(entry.path(), visitor);
            let left = visitor.leave_dir(entry, state);
            walked?;
            left
        }
        Visit::SkipSubtree => Ok(()),
    }
}

fn display_error_path(err: &walkdir::Error) -> String {
    err.path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}
