//! Background auto-commit for sinks with an interval policy.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::sinks::Sink;

/// A dedicated committer task for one sink.
///
/// Sleeps on its interval and calls [`Sink::commit`]; a shutdown notify
/// wakes it to exit cleanly. Commit failures are logged and the cadence
/// continues, the next interval will retry.
pub struct Committer {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Committer {
    pub fn spawn(sink: Arc<dyn Sink>, interval: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn({
            let shutdown = Arc::clone(&shutdown);
            async move {
                loop {
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        _ = tokio::time::sleep(interval) => {
                            if let Err(err) = sink.commit().await {
                                tracing::warn!(
                                    sink = sink.name(),
                                    error = %err,
                                    "periodic commit failed"
                                );
                            }
                        }
                    }
                }
                tracing::debug!(sink = sink.name(), "committer stopped");
            }
        });
        Self { shutdown, handle }
    }

    /// Wake the task and wait for it to finish.
    pub async fn stop(self) {
        // notify_one stores a permit, so the wakeup is not lost if the task
        // is mid-commit rather than parked on notified().
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}
