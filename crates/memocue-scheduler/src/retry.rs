//! Retry policy — exponential backoff for failed executions.

use std::time::Duration;

use memocue_core::config::SchedulerConfig;

/// What to do after a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again after `delay`; `attempt` is the 1-based retry number.
    Retry { attempt: u32, delay: Duration },
    /// Retry budget spent; drop the job.
    GiveUp,
}

/// `delay = min(base * 2^retry_count, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl RetryBackoff {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            base: Duration::from_millis(config.retry_base_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            max_retries: config.max_retries,
        }
    }

    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    /// Decide after the `retry_count`-th consecutive failure (already
    /// incremented). `max_retries` overrides the configured budget.
    pub fn decide(&self, retry_count: u32, max_retries: Option<u32>) -> RetryDecision {
        if retry_count > max_retries.unwrap_or(self.max_retries) {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry {
                attempt: retry_count,
                delay: self.delay_for(retry_count),
            }
        }
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}
