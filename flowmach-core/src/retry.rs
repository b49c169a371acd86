use crate::types::ErrorClass;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of consulting the retry policy for one failure.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryDecision {
    /// Re-execute from the latest checkpoint after the backoff elapses.
    Retry { after: Duration },
    /// Attempt budget exhausted or failure is fatal; hospitalize.
    GiveUp,
}

/// Classifies failures and bounds retry attempts.
///
/// Transient failures retry with exponential backoff up to `max_attempts`
/// total executions; fatal failures never retry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total executions allowed, the first attempt included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 50,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Decide what to do after a failed attempt. `retry_count` is the number
    /// of attempts that have now failed, so the first failure arrives here
    /// with `retry_count == 1`.
    pub fn decide(&self, class: ErrorClass, retry_count: u32) -> RetryDecision {
        match class {
            ErrorClass::Fatal => RetryDecision::GiveUp,
            ErrorClass::Transient if retry_count >= self.max_attempts => RetryDecision::GiveUp,
            ErrorClass::Transient => RetryDecision::Retry {
                after: self.backoff(retry_count),
            },
        }
    }

    /// Exponential backoff for the given failed-attempt count, capped at
    /// `max_delay_ms`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(32);
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exp as i32);
        Duration::from_millis((raw as u64).min(self.max_delay_ms))
    }
}
