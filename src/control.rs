//! Cooperative cancellation shared by the supervisor, tailers and
//! committers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A cloneable stop flag.
///
/// The supervisor raises the flag once on shutdown; tailers poll it between
/// log entries and dump batches, and every blocking wait in the engine
/// selects on [`stopped`](Self::stopped) so raised flags unblock reads
/// promptly. The cancel is cooperative: an in-flight sink call runs to
/// completion before its tailer exits.
#[derive(Clone, Debug, Default)]
pub struct StopFlag {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every waiter. Idempotent.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once the flag has been raised.
    pub async fn stopped(&self) {
        loop {
            if self.is_stopped() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register as a waiter before the re-check so a concurrent
            // stop() cannot slip between the check and the await.
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_wakes_waiters() {
        let flag = StopFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.stopped().await })
        };
        assert!(!flag.is_stopped());
        flag.stop();
        waiter.await.unwrap();
        assert!(flag.is_stopped());
    }

    #[tokio::test]
    async fn stopped_returns_immediately_when_already_raised() {
        let flag = StopFlag::new();
        flag.stop();
        flag.stopped().await;
    }
}
