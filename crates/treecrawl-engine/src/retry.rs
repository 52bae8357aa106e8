//! Retry/backoff policy.

use std::time::Duration;

use treecrawl_core::{Task, TaskError};

use crate::config::RetryConfig;

/// What to do with a task whose attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-queue after `delay`; this will be retry number `attempt`.
    Retry { delay: Duration, attempt: u32 },
    /// Give up on the task.
    Fail,
}

/// Exponential backoff with a bounded number of retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    delay_base: Duration,
    backoff_multiplier: f64,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay_base: config.delay_base,
            backoff_multiplier: config.backoff_multiplier,
            max_delay: config.max_delay,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the retry that follows `retry_count` earlier retries:
    /// `base * multiplier^retry_count`, capped at `max_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let secs = self.delay_base.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide the fate of `task` after it failed with `error`.
    pub fn decide(&self, task: &Task, error: &TaskError) -> RetryDecision {
        self.decide_attempt(task.retry_count, error)
    }

    /// Same as [`decide`](Self::decide) for work that is not a queued task.
    pub fn decide_attempt(&self, retry_count: u32, error: &TaskError) -> RetryDecision {
        if !error.is_retryable() || retry_count >= self.max_retries {
            return RetryDecision::Fail;
        }
        RetryDecision::Retry {
            delay: self.delay_for(retry_count),
            attempt: retry_count + 1,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}
