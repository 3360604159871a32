use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};

/// How long the write stream must stay quiet before a background flush fires.
pub const FLUSH_IDLE_WINDOW: Duration = Duration::from_millis(500);

enum Message {
    Activity,
    Shutdown,
}

/// Debounced background flusher.
///
/// Every write notifies the scheduler; the worker flushes only once no notification has
/// arrived for a full idle window, so a burst of updates costs one flush, not one per
/// update. Dropping the scheduler stops the worker without a trailing flush; callers
/// that need durability at shutdown call [`FlushScheduler::force`] first.
pub struct FlushScheduler {
    tx: Sender<Message>,
    worker: Option<JoinHandle<()>>,
    flush: Arc<dyn Fn() + Send + Sync>,
}

impl FlushScheduler {
    pub fn new(idle_window: Duration, flush: Arc<dyn Fn() + Send + Sync>) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Message>();
        let worker_flush = Arc::clone(&flush);
        let worker = std::thread::Builder::new()
            .name("quarry-flush".to_string())
            .spawn(move || loop {
                match rx.recv() {
                    Ok(Message::Activity) => loop {
                        match rx.recv_timeout(idle_window) {
                            // Still busy; restart the idle window.
                            Ok(Message::Activity) => {}
                            Ok(Message::Shutdown) => return,
                            Err(RecvTimeoutError::Timeout) => {
                                worker_flush();
                                break;
                            }
                            Err(RecvTimeoutError::Disconnected) => return,
                        }
                    },
                    Ok(Message::Shutdown) | Err(_) => return,
                }
            })?;
        Ok(Self {
            tx,
            worker: Some(worker),
            flush,
        })
    }

    /// Records write activity, postponing the next background flush.
    pub fn notify(&self) {
        let _ = self.tx.send(Message::Activity);
    }

    /// Runs the flush action synchronously on the calling thread.
    pub fn force(&self) {
        (self.flush)();
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn burst_of_activity_flushes_once() {
        let flushes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flushes);
        let scheduler = FlushScheduler::new(
            Duration::from_millis(30),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        for _ in 0..10 {
            scheduler.notify();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(flushes.load(Ordering::SeqCst), 0);

        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn quiet_scheduler_never_flushes() {
        let flushes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flushes);
        let scheduler = FlushScheduler::new(
            Duration::from_millis(10),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(60));
        drop(scheduler);
        assert_eq!(flushes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn force_flushes_on_the_calling_thread() {
        let flushes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flushes);
        let scheduler = FlushScheduler::new(
            Duration::from_secs(60),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        scheduler.force();
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
    }
}
