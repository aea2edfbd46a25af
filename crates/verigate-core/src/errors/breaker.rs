//! Per-service circuit breakers.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::BreakerConfig;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are blocked until the cool-down elapses.
    Open,
    /// Cool-down elapsed; trial calls are admitted.
    HalfOpen,
}

/// Guard that stops calling a failing dependency until a cool-down elapses.
///
/// `failures` resets to zero only on a recorded success or a manual reset.
/// `Closed→Open` when `failures` reaches the threshold; `Open→HalfOpen` once
/// the cool-down has elapsed since the last failure; the next success in
/// `HalfOpen` closes the breaker, the next failure re-opens it. While
/// `HalfOpen` every caller is admitted, not just a single probe call.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    failures: u32,
    failure_threshold: u32,
    timeout: Duration,
    last_failure: Option<Instant>,
    state: BreakerState,
}

impl CircuitBreaker {
    /// Create a closed breaker for `name` with the given tunables.
    #[must_use]
    pub fn new(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            name: name.into(),
            failures: 0,
            failure_threshold: config.failure_threshold,
            timeout: config.timeout,
            last_failure: None,
            state: BreakerState::Closed,
        }
    }

    /// Whether a call may be attempted now.
    ///
    /// Transitions `Open→HalfOpen` when the cool-down has elapsed.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let cooled_down = self
                    .last_failure
                    .is_some_and(|at| at.elapsed() >= self.timeout);
                if cooled_down {
                    tracing::info!(service = %self.name, "circuit breaker half-open");
                    self.state = BreakerState::HalfOpen;
                }
                cooled_down
            },
        }
    }

    /// Record a successful call: close the breaker and clear the counter.
    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            tracing::info!(service = %self.name, "circuit breaker closed");
        }
        self.failures = 0;
        self.last_failure = None;
        self.state = BreakerState::Closed;
    }

    /// Record a failed call.
    ///
    /// Opens the breaker at the failure threshold, or immediately when the
    /// failure happens in `HalfOpen`.
    pub fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());
        let opens = self.state == BreakerState::HalfOpen || self.failures >= self.failure_threshold;
        if opens && self.state != BreakerState::Open {
            tracing::warn!(
                service = %self.name,
                failures = self.failures,
                "circuit breaker opened"
            );
            self.state = BreakerState::Open;
        }
    }

    /// Manually reset to closed with a cleared counter.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.last_failure = None;
        self.state = BreakerState::Closed;
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> BreakerState {
        self.state
    }

    /// Current failure count.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Service name this breaker guards.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "pattern-store",
            &BreakerConfig {
                failure_threshold: threshold,
                timeout,
            },
        )
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let mut breaker = breaker(5, Duration::from_secs(60));
        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.failures(), 5);
        assert!(!breaker.can_attempt());
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let mut breaker = breaker(1, Duration::from_millis(20));
        breaker.record_failure();
        assert!(!breaker.can_attempt());

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.can_attempt());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_half_open_success_closes_and_clears() {
        let mut breaker = breaker(1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.can_attempt());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failures(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut breaker = breaker(3, Duration::from_millis(10));
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.can_attempt());

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.can_attempt());
    }

    #[test]
    fn test_failures_survive_until_success_or_reset() {
        let mut breaker = breaker(5, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.failures(), 2);

        breaker.reset();
        assert_eq!(breaker.failures(), 0);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
