//! Bounded retry for routed operations.

use std::future::Future;
use std::time::Duration;

use crate::error::{ShardError, ShardResult};

/// Cap on the backoff exponent so the shift never overflows.
const MAX_SHIFT: u32 = 6;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1 for the first retry).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_SHIFT);
        self.base_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts run out.
///
/// `on_retry` sees every retryable failure before the backoff, which is where
/// callers refresh routing after a `StaleConfig`.
pub async fn retry_routed<T, Op, Fut, OnRetry>(
    policy: &RetryPolicy,
    what: &str,
    mut op: Op,
    mut on_retry: OnRetry,
) -> ShardResult<T>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = ShardResult<T>>,
    OnRetry: FnMut(&ShardError),
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                tracing::debug!(op = what, attempt, error = %err, "retrying routed operation");
                on_retry(&err);
                tokio::time::sleep(policy.backoff(attempt)).await;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::warn!(op = what, attempts, error = %err, "routed operation ran out of retries");
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_then_caps() {
        let policy = RetryPolicy {
            max_attempts: 20,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(5));
        assert_eq!(policy.backoff(2), Duration::from_millis(10));
        assert_eq!(policy.backoff(5), Duration::from_millis(80));
        assert_eq!(policy.backoff(6), Duration::from_millis(100));
        assert_eq!(policy.backoff(60), Duration::from_millis(100));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn only_retryable_errors_are_retried() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let res: ShardResult<()> = retry_routed(
            &policy,
            "test",
            move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ShardError::conflict("a.b", "busy"))
            },
            |_| {},
        )
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        calls.store(0, Ordering::SeqCst);
        let res: ShardResult<()> = retry_routed(
            &policy,
            "test",
            move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ShardError::InvalidOptions("bad".into()))
            },
            |_| {},
        )
        .await;
        assert!(matches!(res, Err(ShardError::InvalidOptions(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut refreshed = 0;
        let value = retry_routed(
            &policy,
            "test",
            |attempt| async move {
                if attempt < 2 {
                    Err(ShardError::stale("a.b", None, None))
                } else {
                    Ok(attempt)
                }
            },
            |err| {
                assert!(err.is_stale_config());
                refreshed += 1;
            },
        )
        .await
        .expect("second attempt succeeds");
        assert_eq!(value, 2);
        assert_eq!(refreshed, 1);
    }
}
