use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::Result;

/// How long a waiter sleeps between polls of an index that is not `Ok`.
pub const REBUILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

const OK: u8 = 0;
const REQUIRES_REBUILD: u8 = 1;
const DOING_REBUILD: u8 = 2;

/// Per-index rebuild state machine.
///
/// Any thread may request a rebuild; exactly one thread wins the transition to
/// `DOING_REBUILD` and runs the clear action. Everyone else blocks in a bounded poll
/// loop until the status returns to `Ok`.
#[derive(Debug, Default)]
pub struct RebuildStatus {
    state: AtomicU8,
}

impl RebuildStatus {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.state.load(Ordering::Acquire) == OK
    }

    /// Requests a rebuild; returns whether this call made the transition (false if a
    /// rebuild was already pending or running).
    pub fn request_rebuild(&self) -> bool {
        self.state
            .compare_exchange(OK, REQUIRES_REBUILD, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The single entry point for getting an index back to `Ok`.
    ///
    /// Loops until the status is `Ok`. The thread that wins the CAS to `DOING_REBUILD`
    /// runs `clear`; on success the status goes to `Ok`, on failure it reverts to
    /// `REQUIRES_REBUILD` (eligible for retry) and the error propagates. Losing threads
    /// sleep-poll.
    pub fn clear_index_if_necessary(&self, clear: impl FnOnce() -> Result<()>) -> Result<()> {
        let mut clear = Some(clear);
        loop {
            match self.state.load(Ordering::Acquire) {
                OK => return Ok(()),
                REQUIRES_REBUILD
                    if self
                        .state
                        .compare_exchange(
                            REQUIRES_REBUILD,
                            DOING_REBUILD,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok() =>
                {
                    let clear = clear.take().expect("clear action runs at most once");
                    match clear() {
                        Ok(()) => {
                            let raced = self
                                .state
                                .compare_exchange(
                                    DOING_REBUILD,
                                    OK,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_err();
                            debug_assert!(!raced, "no other thread may leave DOING_REBUILD");
                            return Ok(());
                        }
                        Err(err) => {
                            self.state.store(REQUIRES_REBUILD, Ordering::Release);
                            return Err(err);
                        }
                    }
                }
                _ => std::thread::sleep(REBUILD_POLL_INTERVAL),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IndexError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn request_rebuild_is_idempotent() {
        let status = RebuildStatus::new();
        assert!(status.is_ok());
        assert!(status.request_rebuild());
        assert!(!status.request_rebuild());
        assert!(!status.is_ok());
    }

    #[test]
    fn failed_clear_stays_eligible_for_retry() {
        let status = RebuildStatus::new();
        status.request_rebuild();

        let result = status.clear_index_if_necessary(|| {
            Err(IndexError::Mapper {
                message: "boom".to_string(),
            })
        });
        assert!(result.is_err());
        assert!(!status.is_ok());

        status.clear_index_if_necessary(|| Ok(())).unwrap();
        assert!(status.is_ok());
    }

    #[test]
    fn concurrent_clears_run_the_action_exactly_once() {
        let status = Arc::new(RebuildStatus::new());
        status.request_rebuild();
        let runs = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let status = Arc::clone(&status);
                let runs = Arc::clone(&runs);
                std::thread::spawn(move || {
                    status
                        .clear_index_if_necessary(|| {
                            runs.fetch_add(1, Ordering::SeqCst);
                            // Give the other threads a chance to observe DOING_REBUILD.
                            std::thread::sleep(Duration::from_millis(20));
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(status.is_ok());
    }
}
