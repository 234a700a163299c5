//! Retry policy evaluation for activities and local activities.

use crate::failure::Failure;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy attached to activity and local-activity invocations.
///
/// `maximum_attempts == 0` means unlimited attempts; expiration is then
/// bounded only by the schedule-to-close timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOptions {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_interval: Option<Duration>,
    pub maximum_attempts: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub do_not_retry: Vec<String>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: None,
            maximum_attempts: 0,
            do_not_retry: Vec::new(),
        }
    }
}

impl RetryOptions {
    /// Backoff to wait before the given attempt. Attempts are 1-based; the
    /// backoff before attempt 2 is the initial interval.
    pub fn backoff_for_attempt(&self, attempt: i32) -> Duration {
        let exponent = attempt.max(2) - 2;
        let backoff = self
            .initial_interval
            .mul_f64(self.backoff_coefficient.powi(exponent));
        match self.maximum_interval {
            Some(max) if backoff > max => max,
            _ => backoff,
        }
    }

    /// Whether another attempt should be made after `failure` on the given
    /// (1-based) attempt.
    pub fn should_retry(&self, attempt: i32, failure: &Failure) -> bool {
        if self.maximum_attempts > 0 && attempt >= self.maximum_attempts {
            return false;
        }
        if failure.is_non_retryable() {
            return false;
        }
        if let Some(failure_type) = failure.application_type() {
            if self.do_not_retry.iter().any(|t| t == failure_type) {
                return false;
            }
        }
        true
    }
}
