//! Core shared types for Quarry.
//!
//! This crate is intentionally small and dependency-light.

mod cancellation;
pub mod logging;

pub use cancellation::{CancellationToken, Cancelled};

/// Dense, non-negative identifier for an input file.
///
/// Ids are allocated by the host's file system layer and may be recycled after a file is
/// deleted. Quarry treats them as opaque join keys between the forward and inverted data;
/// stale associations left behind by recycled ids are reclaimed by the engine's periodic
/// stale-id sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InputId(u32);

impl InputId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn to_raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for InputId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle for a registered index, assigned by the registry at registration time.
///
/// The numeric value is only meaningful within the registry that produced it; the
/// registry resolves it back to the index name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexId(u32);

impl IndexId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn to_raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for IndexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "index#{}", self.0)
    }
}
