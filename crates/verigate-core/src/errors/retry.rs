//! Retry with jittered exponential backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::config::RetryConfig;

/// Backoff policy for retried operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each further retry.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry number `attempt` (1-based), without
    /// jitter: exponential doubling capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1_u32 << exp);
        delay.min(self.max_delay)
    }

    /// The backoff delay with up to 10% random jitter added, so retries of
    /// concurrent callers do not align into storms.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..=0.10));
        delay + jitter
    }
}

/// All attempts failed.
#[derive(Debug, Error)]
#[error("operation failed after {attempts} attempts: {last_error}")]
pub struct RetryExhausted<E: std::fmt::Display + std::fmt::Debug> {
    /// Attempts made.
    pub attempts: u32,
    /// The error from the final attempt.
    pub last_error: E,
}

/// Invoke `operation` until it succeeds or `policy.max_attempts` is
/// exhausted, sleeping the jittered backoff between attempts.
///
/// The closure receives the 1-based attempt number. There is no external
/// cancellation; a retry run ends only by success or exhaustion.
///
/// # Errors
///
/// Returns [`RetryExhausted`] carrying the final attempt's error.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T, RetryExhausted<E>>
where
    E: std::fmt::Display + std::fmt::Debug,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts => {
                return Err(RetryExhausted {
                    attempts: attempt,
                    last_error: err,
                });
            },
            Err(err) => {
                let delay = policy.jittered_delay(attempt);
                tracing::debug!(
                    attempt,
                    delay = ?delay,
                    error = %err,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
        }
    }
}
