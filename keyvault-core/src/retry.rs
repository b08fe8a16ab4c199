//! Bounded exponential-backoff retries for transient failures.
//!
//! Secure-hardware calls and attestation round-trips fail transiently often
//! enough that callers want a uniform retry discipline. The helper wraps any
//! fallible async operation; the backoff wait is cooperative, so it never
//! blocks unrelated work, and the final failure is returned unchanged rather
//! than wrapped.

use std::cell::Cell;
use std::future::Future;
use std::time::Duration;

use backon::ExponentialBuilder;
use backon::Retryable;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Bounds for [`retry`]: total attempts and the backoff window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Treated as 1 if 0.
    pub max_attempts: usize,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound any single delay is capped at.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt.
    pub backoff_factor: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
        }
    }
}

/// Runs `operation` until it succeeds or `policy.max_attempts` is exhausted.
///
/// Each failed attempt is followed by a non-blocking wait that starts at
/// `initial_delay` and grows by `backoff_factor`, capped at `max_delay`.
/// Every attempt, retry and outcome is logged with its attempt count.
///
/// # Errors
///
/// Returns the error from the last attempt unchanged once all attempts are
/// exhausted; the failure type and value are preserved, never wrapped.
pub async fn retry<Op, Fut, T, E>(policy: &RetryPolicy, task: &str, mut operation: Op) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let backoff = ExponentialBuilder::default()
        .with_factor(policy.backoff_factor)
        .with_min_delay(policy.initial_delay)
        .with_max_delay(policy.max_delay)
        .with_max_times(max_attempts - 1);

    let attempt = Cell::new(0_usize);

    let result = (|| {
        attempt.set(attempt.get() + 1);
        debug!(task, attempt = attempt.get(), max_attempts, "starting attempt");
        operation()
    })
    .retry(backoff)
    .notify(|err: &E, delay: Duration| {
        warn!(
            task,
            attempt = attempt.get(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            %err,
            "attempt failed, backing off before retry"
        );
    })
    .await;

    match &result {
        Ok(_) => info!(task, attempts = attempt.get(), "operation succeeded"),
        Err(err) => warn!(task, attempts = attempt.get(), %err, "operation failed, retries exhausted"),
    }

    result
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::retry;
    use super::RetryPolicy;

    #[derive(Debug, PartialEq, Eq, thiserror::Error)]
    #[error("flaky operation failed: {0}")]
    struct FlakyError(u32);

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_factor: 2.0,
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_retrying() {
        let calls = AtomicUsize::new(0);

        let value = retry(&fast_policy(3), "first_attempt", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, FlakyError>(42)
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn returns_success_after_transient_failures() {
        let calls = AtomicUsize::new(0);

        let value = retry(&fast_policy(5), "transient", || async {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 4 {
                Err(FlakyError(7))
            } else {
                Ok("done")
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "done");
        // Three failures plus the successful fourth attempt, nothing more.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_preserves_the_original_error() {
        let calls = AtomicUsize::new(0);

        let err = retry(&fast_policy(3), "exhausted", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(FlakyError(13))
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err, FlakyError(13));
    }

    #[tokio::test]
    async fn zero_max_attempts_still_runs_once() {
        let calls = AtomicUsize::new(0);

        retry(&fast_policy(0), "clamped", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(FlakyError(1))
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
