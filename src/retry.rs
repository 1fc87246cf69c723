//! Retry discipline for source reads and sink writes.
//!
//! Read-only source operations (post-image fetches, cursor restarts) are
//! retried until they succeed or the engine is cancelled. Sink writes are
//! retried only while the sink surfaces a typed transient error; any other
//! failure is returned to the caller's error policy.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::control::StopFlag;
use crate::errors::ReplicationError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Retry `op` with exponential backoff until it succeeds.
///
/// Returns `None` when the stop flag is raised before a success.
pub async fn retry_until_ok<T, F, Fut>(stop: &StopFlag, mut op: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ReplicationError>>,
{
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if stop.is_stopped() {
            return None;
        }
        match op().await {
            Ok(value) => return Some(value),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "operation failed, retrying"
                );
                if !sleep_backoff(stop, &mut backoff).await {
                    return None;
                }
            }
        }
    }
}

/// Retry `op` only while it fails with a transient error.
///
/// `Some(Err(..))` carries the first non-transient failure; `None` means
/// the engine was cancelled mid-retry.
pub async fn retry_transient<T, F, Fut>(
    stop: &StopFlag,
    mut op: F,
) -> Option<Result<T, ReplicationError>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ReplicationError>>,
{
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if stop.is_stopped() {
            return None;
        }
        match op().await {
            Err(err) if err.is_transient() => {
                tracing::warn!(
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "transient failure, retrying"
                );
                if !sleep_backoff(stop, &mut backoff).await {
                    return None;
                }
            }
            other => return Some(other),
        }
    }
}

/// Sleep for the current backoff plus jitter; doubles the backoff up to the
/// cap. Returns false when woken by cancellation.
async fn sleep_backoff(stop: &StopFlag, backoff: &mut Duration) -> bool {
    let jitter_ceiling = (backoff.as_millis() as u64 / 4).max(1);
    let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_ceiling));
    let cancelled = tokio::select! {
        _ = stop.stopped() => true,
        _ = tokio::time::sleep(*backoff + jitter) => false,
    };
    *backoff = (*backoff * 2).min(MAX_BACKOFF);
    !cancelled
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);
        let stop = StopFlag::new();
        let result = retry_until_ok(&stop, || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ReplicationError::connection("not yet"))
            } else {
                Ok(attempts.load(Ordering::SeqCst))
            }
        })
        .await;
        assert_eq!(result, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_retry_stops_on_semantic_errors() {
        let attempts = AtomicU32::new(0);
        let stop = StopFlag::new();
        let result = retry_transient::<(), _, _>(&stop, || async {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ReplicationError::connection("blip"))
            } else {
                Err(ReplicationError::operation("malformed"))
            }
        })
        .await;
        assert!(matches!(
            result,
            Some(Err(ReplicationError::OperationFailed { .. }))
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_retry() {
        let stop = StopFlag::new();
        stop.stop();
        let result =
            retry_until_ok::<(), _, _>(&stop, || async { Err(ReplicationError::connection("x")) })
                .await;
        assert!(result.is_none());
    }
}
