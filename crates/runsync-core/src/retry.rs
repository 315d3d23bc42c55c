//! Retry with exponential backoff.
//!
//! The driver is generic over the error type: anything implementing
//! [`Retryable`] says whether it is worth another attempt and may carry a
//! server-requested delay (HTTP `Retry-After`) that overrides the computed
//! backoff.
//!
//! # Usage
//!
//! ```rust,ignore
//! use runsync_core::retry::{RetryPolicy, with_retry_outcome};
//!
//! let policy = RetryPolicy::file_stream();
//! let outcome = with_retry_outcome(&policy, || async {
//!     transport.post_file_stream(&target, &request).await
//! })
//! .await;
//! ```
//!
//! Attempts stop at the first success, at a non-retryable error, after
//! `max_attempts`, or when the next sleep would exceed `max_elapsed`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Errors the retry driver can reason about.
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Delay the remote side asked for, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Initial delay before first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each retry.
    pub backoff_factor: f64,
    /// Random jitter range as a fraction (0.25 = ±25%).
    pub jitter_percent: f64,
    /// Maximum number of attempts. None = bounded only by `max_elapsed`.
    pub max_attempts: Option<u32>,
    /// Total time budget across all attempts and sleeps.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::file_stream()
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
        max_elapsed: Option<Duration>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts,
            max_elapsed,
        }
    }

    /// Policy for file-stream posts: 2s doubling to 5 min, ~2 hours overall.
    #[must_use]
    pub fn file_stream() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            jitter_percent: 0.25,
            max_attempts: Some(30),
            max_elapsed: Some(Duration::from_secs(2 * 60 * 60)),
        }
    }

    /// Policy for one-off queries such as the resume lookup.
    #[must_use]
    pub fn query() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(5),
            max_elapsed: Some(Duration::from_secs(60)),
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // attempt is capped at 31, safe for i32
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 && base_ms > 0.0 {
            let jitter_range = base_ms * self.jitter_percent;
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).clamp(0.0, max_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Why the driver stopped without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUp {
    NonRetryable,
    AttemptsExhausted,
    BudgetExhausted,
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// The result (success or final error).
    pub result: Result<T, E>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent (including delays).
    pub elapsed: Duration,
    /// Set when `result` is an error.
    pub gave_up: Option<GiveUp>,
}

impl<T, E> RetryOutcome<T, E> {
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Execute an async operation with retry, returning detailed outcome.
pub async fn with_retry_outcome<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        total_attempts = attempt + 1,
                        retries = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                    gave_up: None,
                };
            }
            Err(e) => {
                attempt += 1;
                let give_up = |reason: GiveUp, e: E| RetryOutcome {
                    result: Err(e),
                    attempts: attempt,
                    elapsed: start.elapsed(),
                    gave_up: Some(reason),
                };

                if !e.is_retryable() {
                    debug!(attempt, error = %e, "Non-retryable error, giving up");
                    return give_up(GiveUp::NonRetryable, e);
                }

                if let Some(max) = policy.max_attempts {
                    if attempt >= max {
                        warn!(
                            attempt,
                            max_attempts = max,
                            error = %e,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Operation failed after all retry attempts"
                        );
                        return give_up(GiveUp::AttemptsExhausted, e);
                    }
                }

                let delay = e
                    .retry_after()
                    .unwrap_or_else(|| policy.delay_for_attempt(attempt - 1));

                if let Some(budget) = policy.max_elapsed {
                    if start.elapsed() + delay > budget {
                        warn!(
                            attempt,
                            budget_ms = budget.as_millis() as u64,
                            error = %e,
                            "Retry budget exhausted"
                        );
                        return give_up(GiveUp::BudgetExhausted, e);
                    }
                }

                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying operation after retryable failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Transient,
        Fatal,
        Throttled(Duration),
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            !matches!(self, Self::Fatal)
        }

        fn retry_after(&self) -> Option<Duration> {
            match self {
                Self::Throttled(d) => Some(*d),
                _ => None,
            }
        }
    }

    fn fast_policy(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts,
            max_elapsed: None,
        }
    }

    #[test]
    fn delay_calculation_with_backoff() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts: Some(5),
            max_elapsed: None,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_respects_max() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter_percent: 0.0,
            ..RetryPolicy::file_stream()
        };
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1_000), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_in_range_and_under_cap() {
        let policy = RetryPolicy::file_stream();
        for attempt in 0..12 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay <= policy.max_delay);
            if attempt == 0 {
                assert!(delay >= Duration::from_millis(1_500));
                assert!(delay <= Duration::from_millis(2_500));
            }
        }
    }

    #[test]
    fn new_clamps_parameters() {
        let policy = RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(2),
            0.5,
            3.0,
            None,
            None,
        );
        assert!((policy.backoff_factor - 1.0).abs() < f64::EPSILON);
        assert!((policy.jitter_percent - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = with_retry_outcome(&fast_policy(Some(5)), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(*outcome.result.as_ref().unwrap(), 42);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retries(), 2);
        assert!(outcome.gave_up.is_none());
    }

    #[tokio::test]
    async fn non_retryable_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome: RetryOutcome<(), _> = with_retry_outcome(&fast_policy(Some(5)), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Fatal) }
        })
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.gave_up, Some(GiveUp::NonRetryable));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let outcome: RetryOutcome<(), _> =
            with_retry_outcome(&fast_policy(Some(3)), || async { Err(TestError::Transient) })
                .await;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.gave_up, Some(GiveUp::AttemptsExhausted));
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_budget_is_enforced() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            backoff_factor: 1.0,
            jitter_percent: 0.0,
            max_attempts: None,
            max_elapsed: Some(Duration::from_secs(35)),
        };
        let outcome: RetryOutcome<(), _> =
            with_retry_outcome(&policy, || async { Err(TestError::Transient) }).await;
        // Sleeps at 0s, 10s, 20s fit; the fourth would end at 40s.
        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.gave_up, Some(GiveUp::BudgetExhausted));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let started = tokio::time::Instant::now();
        let outcome = with_retry_outcome(&fast_policy(Some(3)), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TestError::Throttled(Duration::from_secs(7)))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(outcome.result.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(7));
    }
}
