//! Tracing setup for binaries and tests embedding Quarry.
//!
//! The engine itself only emits `tracing` events (under the `quarry.storage` and
//! `quarry.index` targets); installing a subscriber is the host's call. This helper
//! covers the common case of an stderr subscriber driven by `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Installs a global stderr subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; only the first call installs anything, so tests can all
/// call it without coordinating.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
