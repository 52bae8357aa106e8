//! Circuit breaker guarding page reuse.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use treecrawl_core::CircuitState;

use crate::config::CircuitBreakerConfig;

/// Tracks consecutive page failures and suspends reuse when they pile up.
///
/// Closed: pages are reused. After `failure_threshold` consecutive failures
/// inside `window` the breaker opens and every acquisition creates a fresh
/// page. It closes again after `recovery_successes` consecutive successful
/// fresh acquisitions.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    window: Duration,
    recovery_successes: u32,
    state: CircuitState,
    /// Timestamps of the current run of consecutive failures.
    failures: VecDeque<Instant>,
    fresh_successes: u32,
    trips: u64,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            window: config.window,
            recovery_successes: config.recovery_successes,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            fresh_successes: 0,
            trips: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// Number of times the breaker opened.
    pub fn trips(&self) -> u64 {
        self.trips
    }

    /// Record a failed page operation or page creation.
    pub fn record_failure(&mut self) {
        let now = Instant::now();
        self.failures.push_back(now);
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }

        match self.state {
            CircuitState::Closed => {
                if self.failures.len() as u32 >= self.failure_threshold {
                    self.state = CircuitState::Open;
                    self.fresh_successes = 0;
                    self.trips += 1;
                    warn!(
                        failures = self.failures.len(),
                        "Browser circuit breaker opened due to repeated failures"
                    );
                }
            }
            CircuitState::Open => {
                self.fresh_successes = 0;
            }
        }
    }

    /// Record a page that completed its task without error.
    pub fn record_success(&mut self) {
        if self.state == CircuitState::Closed {
            self.failures.clear();
        }
    }

    /// Record a fresh page created while the breaker is open. No-op when
    /// closed.
    pub fn record_fresh_success(&mut self) {
        if self.state == CircuitState::Closed {
            return;
        }
        self.fresh_successes += 1;
        if self.fresh_successes >= self.recovery_successes {
            self.state = CircuitState::Closed;
            self.failures.clear();
            self.fresh_successes = 0;
            info!("Browser circuit breaker recovered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerConfig {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            recovery_successes: 2,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_consecutive_failures() {
        let mut cb = breaker();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.trips(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let mut cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_failures_leave_the_window() {
        let mut cb = breaker();
        cb.record_failure();
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(61)).await;
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_fresh_successes() {
        let mut cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        cb.record_fresh_success();
        assert!(cb.is_open());
        // A failure while open restarts the recovery count.
        cb.record_failure();
        cb.record_fresh_success();
        assert!(cb.is_open());
        cb.record_fresh_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
