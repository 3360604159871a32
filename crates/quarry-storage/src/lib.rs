//! On-disk primitives for Quarry indices.
//!
//! ## Format
//! Each index owns one append-only [`PersistentLogMap`] for its inverted data and one
//! for its forward mapping, plus a small [`VersionStamp`] file recording the registered
//! index version and a build timestamp. The log map is append-style: every put appends a
//! delta record, and full reconstruction happens at read time by replaying all records
//! for a key since the last compaction.
//!
//! Corruption degrades to a rebuild of the affected index, never to a crash: torn tails
//! are truncated on open, bad headers surface as [`StorageError::Corrupted`], and a
//! process-wide [`CorruptionMarker`] forces every index to rebuild on next startup.

mod lock;
mod log_map;
mod marker;
mod util;
mod version;

pub use lock::DirLock;
pub use log_map::{PersistentLogMap, LOG_FORMAT_VERSION};
pub use marker::CorruptionMarker;
pub use util::atomic_write;
pub use version::{VersionCheck, VersionStamp};

pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors produced by the persistence layer.
///
/// Always surfaced, never swallowed: callers at the per-file applier boundary translate
/// repeated storage errors into a rebuild request for the affected index.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted storage file {path}: {reason}")]
    Corrupted { path: String, reason: String },

    #[error("incompatible storage format version: expected {expected}, found {found}")]
    IncompatibleFormat { expected: u32, found: u32 },

    #[error("storage directory {path} is already locked by another engine instance")]
    AlreadyLocked { path: String },
}

impl StorageError {
    pub(crate) fn corrupted(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}
