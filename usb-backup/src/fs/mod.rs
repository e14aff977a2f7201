//! Filesystem helpers: tree walking and metadata mirroring.

pub mod metadata;
pub mod walker;
