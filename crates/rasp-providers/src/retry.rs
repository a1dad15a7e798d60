//! Retry/backoff helpers shared by the three provider adapters.
//!
//! Mirrors the retry-with-cancellation shape used for LLM calls elsewhere in
//! the ecosystem: a bounded number of attempts, exponential backoff seeded by
//! a base delay, and a wait that races the backoff sleep against the caller's
//! cancellation token so a shutdown or client disconnect is never blocked on.

use std::future::Future;
use std::time::Duration;

use rasp_core::RaspError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Exponential backoff: `base * multiplier ^ (attempt - 1)`, `attempt` is 1-based.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = BACKOFF_MULTIPLIER.powi((attempt.saturating_sub(1)) as i32);
    base.mul_f64(factor)
}

/// Sleeps for `delay`, or returns early with `RaspError::Cancelled` if
/// `cancel` fires first.
pub async fn wait_with_cancellation(delay: Duration, cancel: &CancellationToken) -> Result<(), RaspError> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(RaspError::Cancelled),
    }
}

/// Retries `op` up to `max_attempts` times for retryable errors
/// (`Network`, `ProviderNon2xx`, `RateLimit`), honouring `cancel` between
/// attempts. A `RateLimit` error with a `retry_after_secs` hint waits that
/// long instead of the computed backoff. Non-retryable errors and
/// cancellation propagate immediately.
pub async fn call_with_retry<F, Fut, T>(
    max_attempts: u32,
    base_delay: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RaspError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RaspError>>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(RaspError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = match &err {
                    RaspError::RateLimit {
                        retry_after_secs: Some(secs),
                    } => Duration::from_secs(*secs),
                    _ => backoff_delay(base_delay, attempt),
                };
                warn!(attempt, ?delay, error = %err, "retrying provider call");
                wait_with_cancellation(delay, cancel).await?;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Retries stream *creation* at most once before the first byte is read, per
/// the rule that streaming is never retried once a delta has been delivered.
pub async fn create_stream_with_retry<F, Fut, T>(
    cancel: &CancellationToken,
    mut connect: F,
) -> Result<T, RaspError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RaspError>>,
{
    if cancel.is_cancelled() {
        return Err(RaspError::Cancelled);
    }
    match connect().await {
        Ok(stream) => Ok(stream),
        Err(err) if matches!(err, RaspError::Network(_)) => {
            warn!(error = %err, "retrying stream connect once before first byte");
            wait_with_cancellation(Duration::from_millis(200), cancel).await?;
            connect().await
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_exponentially() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn call_with_retry_stops_after_success() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result = call_with_retry(3, Duration::from_millis(1), &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(RaspError::Network("boom".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn call_with_retry_does_not_retry_terminal_errors() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), RaspError> = call_with_retry(3, Duration::from_millis(1), &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RaspError::Quota("account limit".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn call_with_retry_respects_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), RaspError> = call_with_retry(3, Duration::from_millis(50), &cancel, || async {
            Err(RaspError::Network("boom".into()))
        })
        .await;
        assert!(matches!(result, Err(RaspError::Cancelled)));
    }
}
