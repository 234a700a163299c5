//! Local activity execution helper.
//!
//! Local activities retry on the worker, not on the service; only the final
//! outcome (with its attempt count) is reported back and persisted through a
//! marker. Backoff is recorded rather than slept here: pacing between
//! attempts belongs to the dispatching worker.

use kairos_core::{ExecuteLocalActivityParameters, Failure, LocalActivityExecutionResult};
use serde_json::Value;

/// Run a local activity function under the retry policy of its parameters.
///
/// Without retry options a single attempt is made. A policy with zero
/// maximum attempts retries until a non-retryable or do-not-retry failure.
pub fn execute_local_activity(
    parameters: &ExecuteLocalActivityParameters,
    function: impl Fn(Option<Value>) -> Result<Option<Value>, Failure>,
) -> LocalActivityExecutionResult {
    let mut attempt = 1;
    loop {
        match function(parameters.input.clone()) {
            Ok(result) => {
                return LocalActivityExecutionResult {
                    activity_id: parameters.activity_id.clone(),
                    result,
                    failure: None,
                    attempt,
                    backoff: None,
                };
            }
            Err(failure) => {
                let retry_allowed = parameters
                    .retry_options
                    .as_ref()
                    .is_some_and(|options| options.should_retry(attempt, &failure));
                if !retry_allowed {
                    return LocalActivityExecutionResult {
                        activity_id: parameters.activity_id.clone(),
                        result: None,
                        failure: Some(failure),
                        attempt,
                        backoff: None,
                    };
                }
                tracing::debug!(
                    activity_id = %parameters.activity_id,
                    attempt,
                    "local activity attempt failed, retrying"
                );
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kairos_core::RetryOptions;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn parameters(retry_options: Option<RetryOptions>) -> ExecuteLocalActivityParameters {
        ExecuteLocalActivityParameters {
            activity_id: "la-1".to_string(),
            activity_type: "charge".to_string(),
            input: Some(json!(10)),
            retry_options,
            schedule_to_close_timeout: None,
            start_to_close_timeout: None,
        }
    }

    #[test]
    fn test_success_on_first_attempt() {
        let result = execute_local_activity(&parameters(None), |input| Ok(input));
        assert_eq!(result.attempt, 1);
        assert_eq!(result.result, Some(json!(10)));
        assert!(result.failure.is_none());
    }

    #[test]
    fn test_no_retry_options_means_single_attempt() {
        let calls = AtomicUsize::new(0);
        let result = execute_local_activity(&parameters(None), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Failure::application("io-error", "boom", false, None))
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.attempt, 1);
        assert!(result.failure.is_some());
    }

    #[test]
    fn test_retries_until_maximum_attempts() {
        let options = RetryOptions {
            maximum_attempts: 3,
            ..Default::default()
        };
        let calls = AtomicUsize::new(0);
        let result = execute_local_activity(&parameters(Some(options)), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Failure::application("io-error", "boom", false, None))
        });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.attempt, 3);
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let options = RetryOptions {
            maximum_attempts: 5,
            ..Default::default()
        };
        let calls = AtomicUsize::new(0);
        let result = execute_local_activity(&parameters(Some(options)), |input| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Failure::application("io-error", "flaky", false, None))
            } else {
                Ok(input)
            }
        });
        assert_eq!(result.attempt, 3);
        assert!(result.failure.is_none());
    }

    #[test]
    fn test_do_not_retry_type_stops_immediately() {
        let options = RetryOptions {
            maximum_attempts: 10,
            do_not_retry: vec!["assertion-error".to_string()],
            ..Default::default()
        };
        let calls = AtomicUsize::new(0);
        let result = execute_local_activity(&parameters(Some(options)), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Failure::application(
                "assertion-error",
                "invariant broken",
                false,
                None,
            ))
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            result.failure.as_ref().and_then(|f| f.application_type()),
            Some("assertion-error")
        );
    }
}
