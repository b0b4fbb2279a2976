//! Backoff policies.
//!
//! - `RetryPolicy`: delay between attempts of a failing task
//! - `Backoff`: stateful exponential backoff for infrastructure calls
//! - `retry_transient`: runs an operation until it succeeds, fails with a
//!   non-transient error, or the attempt budget is spent

use std::future::Future;
use std::time::Duration;

use crate::error::Transient;

/// Default base delay for task retries.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);

/// Default ceiling for task retry delays.
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(300);

/// Exponential delay schedule for task retries.
///
/// `delay_for(n) = min(base * factor^n, max)`. No jitter is applied so the
/// sequence of delays is non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_RETRY_BASE,
            factor: 2,
            max: DEFAULT_RETRY_MAX,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy doubling from `base` up to `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            factor: 2,
            max: max.max(base),
        }
    }

    /// Sets the growth factor (values below 1 are treated as 1).
    pub fn with_factor(mut self, factor: u32) -> Self {
        self.factor = factor.max(1);
        self
    }

    /// Returns the delay before retry number `retry_count + 1`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let multiplier = self.factor.max(1).checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base
            .checked_mul(multiplier)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Stateful exponential backoff for reconnect loops.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff doubling from `base` up to `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            policy: RetryPolicy::new(base, max),
            attempt: 0,
        }
    }

    /// Returns the next delay and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Returns the number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Restarts the schedule after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

/// Runs `op` until it succeeds, returns a non-transient error, or
/// `max_attempts` attempts have been made.
pub async fn retry_transient<T, E, F, Fut>(
    what: &str,
    max_attempts: u32,
    mut backoff: Backoff,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    operation = what,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient infrastructure error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct FakeError(bool);

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fake error (transient: {})", self.0)
        }
    }

    impl Transient for FakeError {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn test_retry_policy_doubles_until_cap() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10));

        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(64), Duration::from_secs(10));
    }

    #[test]
    fn test_retry_policy_is_non_decreasing() {
        let policy = RetryPolicy::new(Duration::from_millis(250), Duration::from_secs(60))
            .with_factor(3);

        let delays: Vec<_> = (0..40).map(|n| policy.delay_for(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_retry_transient_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<u32, FakeError> = retry_transient(
            "test",
            5,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(2)),
            || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(FakeError(true))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.expect("third call succeeds"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_stops_on_permanent_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), FakeError> = retry_transient(
            "test",
            5,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(2)),
            || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(FakeError(false))
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_transient_gives_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), FakeError> = retry_transient(
            "test",
            3,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(2)),
            || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(FakeError(true))
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
