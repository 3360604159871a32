use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Raised (as a value) when an operation observes its token cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Cooperative cancellation signal for long-running read operations.
///
/// Readers call [`CancellationToken::checkpoint`] periodically (key enumeration, value
/// iteration) and abort cleanly. Single-file write operations are deliberately not
/// cancellable mid-flight: once an update holds a write lock it runs to completion so
/// the forward and inverted indices stay consistent.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns `Err(Cancelled)` once [`CancellationToken::cancel`] has been observed.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_passes_until_cancelled() {
        let token = CancellationToken::new();
        assert_eq!(token.checkpoint(), Ok(()));

        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.checkpoint(), Err(Cancelled));
    }
}
