//! Retry, backoff and timeout utilities.
//!
//! The helpers in this module are transport-agnostic: the REST executor uses
//! [`retry_async`] for server errors, and the gateway worker uses
//! [`ReconnectBackoff`] between connection attempts and [`with_timeout`]
//! while waiting for hello.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Policy controlling retry attempts and exponential backoff behavior.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Conservative default for REST calls hitting server errors.
    pub fn server_errors() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            jitter: Duration::from_millis(250),
        }
    }

    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 1-based and should correspond to the attempt that just
    /// failed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::server_errors()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `should_retry` determines whether each
/// error is retryable.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

/// Exponential reconnect backoff with jitter.
///
/// The delay doubles after every [`next_delay`](Self::next_delay) call until
/// it reaches `max`, and drops back to `min` on [`reset`](Self::reset).
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    min: Duration,
    max: Duration,
    jitter: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    /// Creates a backoff starting at `min` and capped at `max`.
    pub fn new(min: Duration, max: Duration, jitter: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            jitter,
            current: min,
        }
    }

    /// Returns the delay for the upcoming attempt and advances the curve.
    ///
    /// The returned delay never exceeds `max`, jitter included.
    pub fn next_delay(&mut self) -> Duration {
        let delay = std::cmp::min(self.current + jitter_duration(self.jitter), self.max);
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        delay
    }

    /// Drops the curve back to its minimum.
    pub fn reset(&mut self) {
        self.current = self.min;
    }

    /// Returns the un-jittered delay the next call will be based on.
    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Returns a uniformly random duration in `[0, max_jitter]`.
pub(crate) fn jitter_duration(max_jitter: Duration) -> Duration {
    let limit_millis = max_jitter.as_millis().min(u64::MAX as u128) as u64;
    if limit_millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=limit_millis))
}
