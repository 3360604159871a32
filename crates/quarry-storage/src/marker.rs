use std::path::{Path, PathBuf};

use crate::Result;

const MARKER_FILE_NAME: &str = "corruption.marker";

/// Process-wide corruption marker.
///
/// Dropped into the index root when corruption looks pervasive (rather than scoped to a
/// single index); its presence at the next startup forces every index to rebuild.
#[derive(Debug, Clone)]
pub struct CorruptionMarker {
    path: PathBuf,
}

impl CorruptionMarker {
    pub fn new(index_root: &Path) -> Self {
        Self {
            path: index_root.join(MARKER_FILE_NAME),
        }
    }

    /// Requests an all-index rebuild on next startup.
    pub fn request(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, b"")?;
        tracing::warn!(
            target = "quarry.storage",
            path = %self.path.display(),
            "corruption marker set; all indices will rebuild on next startup"
        );
        Ok(())
    }

    /// Checks for the marker and removes it, returning whether it was present.
    pub fn consume(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_is_consumed_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = CorruptionMarker::new(dir.path());

        assert!(!marker.consume().unwrap());
        marker.request().unwrap();
        assert!(marker.consume().unwrap());
        assert!(!marker.consume().unwrap());
    }
}
