//! Retry helper for RPC fetches.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::IndexerResult;

/// Delay before the second attempt.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Upper bound of the delay between attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// `delay` with ±25% jitter so parallel fetchers do not retry in lockstep.
#[must_use]
pub fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
}

/// Run `operation` up to `attempts` times (at least once), doubling a
/// jittered delay between attempts up to [`MAX_RETRY_DELAY`].
///
/// # Errors
///
/// The last error once all attempts failed, or the first non-retryable one.
pub async fn with_retries<T, F, Fut>(
    what: &str,
    attempts: u32,
    mut operation: F,
) -> IndexerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = IndexerResult<T>>,
{
    let attempts = attempts.max(1);
    let mut delay = INITIAL_RETRY_DELAY;
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(what, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt < attempts && e.is_retryable() => {
                let wait = jittered(delay);
                warn!(
                    what,
                    attempt,
                    attempts,
                    error = %e,
                    retry_in_ms = wait.as_millis(),
                    "Fetch failed, retrying"
                );
                tokio::time::sleep(wait).await;
                delay = std::cmp::min(delay * 2, MAX_RETRY_DELAY);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IndexerError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        for _ in 0..100 {
            let d = jittered(Duration::from_millis(1_000));
            assert!(d >= Duration::from_millis(750) && d <= Duration::from_millis(1_250));
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retries("block 1", 3, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(IndexerError::rpc("connection reset", None))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.expect("third attempt succeeds"), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_all_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: IndexerResult<()> = with_retries("block 1", 2, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(IndexerError::rpc("unavailable", None))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_config_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: IndexerResult<()> = with_retries("block 1", 5, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(IndexerError::config(vec!["bad".to_string()]))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
