use std::io::Read;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{atomic_write, Result};

const STAMP_MAGIC: &[u8; 8] = b"QRYSTAMP";
const STAMP_FORMAT_VERSION: u32 = 1;

/// Per-index version stamp, compared against the registered index version at startup to
/// decide rebuild-vs-reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionStamp {
    pub version: u32,
    pub build_timestamp_millis: u64,
}

/// Outcome of comparing the persisted stamp against the registered version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    /// Stamp present and matching; persisted data is reusable.
    Current,
    /// No stamp on disk; the index has never been built.
    Missing,
    /// Stamp present but stale or unreadable; persisted data must be discarded.
    Mismatched,
}

impl VersionStamp {
    pub fn now(version: u32) -> Self {
        let build_timestamp_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            version,
            build_timestamp_millis,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut out = Vec::with_capacity(24);
        out.extend_from_slice(STAMP_MAGIC);
        out.write_u32::<LittleEndian>(STAMP_FORMAT_VERSION)
            .expect("vec write is infallible");
        out.write_u32::<LittleEndian>(self.version)
            .expect("vec write is infallible");
        out.write_u64::<LittleEndian>(self.build_timestamp_millis)
            .expect("vec write is infallible");
        atomic_write(path, &out)
    }

    /// Reads the stamp at `path`. An unreadable or malformed stamp is reported as
    /// `None` by [`VersionStamp::check`], which treats it as a mismatch; it is never a
    /// hard error because the recovery path (rebuild) is the same either way.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let mut file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut bytes = Vec::with_capacity(24);
        file.read_to_end(&mut bytes)?;
        let mut rd = bytes.as_slice();

        let mut magic = [0u8; 8];
        if rd.read_exact(&mut magic).is_err() || &magic != STAMP_MAGIC {
            return Ok(None);
        }
        let Ok(format) = rd.read_u32::<LittleEndian>() else {
            return Ok(None);
        };
        if format != STAMP_FORMAT_VERSION {
            return Ok(None);
        }
        let Ok(version) = rd.read_u32::<LittleEndian>() else {
            return Ok(None);
        };
        let Ok(build_timestamp_millis) = rd.read_u64::<LittleEndian>() else {
            return Ok(None);
        };

        Ok(Some(Self {
            version,
            build_timestamp_millis,
        }))
    }

    /// Compares the stamp on disk against `registered_version`.
    pub fn check(path: &Path, registered_version: u32) -> Result<VersionCheck> {
        match Self::read(path)? {
            None if !path.exists() => Ok(VersionCheck::Missing),
            None => Ok(VersionCheck::Mismatched),
            Some(stamp) if stamp.version == registered_version => Ok(VersionCheck::Current),
            Some(stamp) => {
                tracing::debug!(
                    target = "quarry.storage",
                    path = %path.display(),
                    stored = stamp.version,
                    registered = registered_version,
                    "index version mismatch"
                );
                Ok(VersionCheck::Mismatched)
            }
        }
    }
}
