use std::future::Future;
use std::time::Duration;

use crate::errors::{Error, Result};

/// Bounded exponential backoff without jitter.
///
/// The first attempt is followed by at most `max_retries` more. Retry `n` (1-based) waits
/// `base * factor^(n-1)` before it starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base: Duration,
    factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), 2)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, factor: u32) -> Self {
        Self {
            max_retries,
            base,
            factor,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry `retry`. Saturates at [`Duration::MAX`] instead of overflowing.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.factor
            .checked_pow(retry.saturating_sub(1))
            .and_then(|multiplier| self.base.checked_mul(multiplier))
            .unwrap_or(Duration::MAX)
    }
}

/// Outcome of a single attempt at a retryable operation.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    Retryable(Error),
    Fatal(Error),
}

impl<T> From<Result<T>> for Attempt<T> {
    fn from(r: Result<T>) -> Attempt<T> {
        match r {
            Ok(t) => Attempt::Done(t),
            Err(e @ Error::TransientTransport(_)) => Attempt::Retryable(e),
            Err(e) => Attempt::Fatal(e),
        }
    }
}

/// Drive `attempt` until it succeeds, fails fatally, or the policy runs out of retries.
///
/// `attempt` receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut attempt_number = 1;
    loop {
        match attempt(attempt_number).await {
            Attempt::Done(t) => return Ok(t),
            Attempt::Fatal(e) => return Err(e),
            Attempt::Retryable(e) if attempt_number >= policy.max_attempts() => {
                return Err(Error::RetriesExhausted {
                    attempts: attempt_number,
                    last: Box::new(e),
                });
            }
            Attempt::Retryable(e) => {
                let delay = policy.backoff(attempt_number);
                tracing::warn!(
                    attempt = attempt_number,
                    ?delay,
                    error = %e,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt_number += 1;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use rstest::*;
    use stevedore_objectstore::Error as ObjectStoreError;

    use super::*;

    fn transient() -> Error {
        ObjectStoreError::Unavailable(String::from("flaky")).into()
    }

    #[rstest]
    #[case::first(1, Duration::from_secs(1))]
    #[case::second(2, Duration::from_secs(2))]
    #[case::third(3, Duration::from_secs(4))]
    fn default_backoff_doubles(#[case] retry: u32, #[case] expected: Duration) {
        assert_eq!(RetryPolicy::default().backoff(retry), expected);
    }

    #[rstest]
    #[case::multiplier_overflows(Duration::from_secs(1), 10, 90)]
    #[case::duration_overflows(Duration::from_secs(u64::MAX / 2), 2, 3)]
    fn backoff_saturates(#[case] base: Duration, #[case] factor: u32, #[case] retry: u32) {
        let policy = RetryPolicy::new(100, base, factor);
        assert_eq!(policy.backoff(retry), Duration::MAX);
    }

    #[test]
    fn backoff_below_overflow_is_exact() {
        let policy = RetryPolicy::new(100, Duration::from_secs(1), 10);
        assert_eq!(policy.backoff(10), Duration::from_secs(1_000_000_000));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<()> = with_retry(&RetryPolicy::default(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Attempt::Retryable(transient()) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(
            result,
            Err(Error::RetriesExhausted { attempts: 4, .. })
        ));
        // 1s + 2s + 4s of backoff
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&RetryPolicy::default(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Attempt::Fatal(Error::Cancelled) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let result = with_retry(&RetryPolicy::default(), |attempt| async move {
            if attempt < 3 {
                Attempt::Retryable(transient())
            } else {
                Attempt::Done(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }
}
