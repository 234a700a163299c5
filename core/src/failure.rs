//! Structured failure model carried through history and workflow results.
//!
//! Failures cross activity and child-workflow boundaries intact: an activity
//! that raises an application failure surfaces to the workflow as an activity
//! failure whose cause is that application failure, and retry policies consult
//! the application failure type against do-not-retry lists.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Timeout kinds reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutType {
    ScheduleToClose,
    ScheduleToStart,
    StartToClose,
    Heartbeat,
}

/// A failure with an optional chained cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<Failure>>,
    #[serde(flatten)]
    pub info: FailureInfo,
}

/// Type-specific failure payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FailureInfo {
    /// User-raised domain failure with an opaque type string.
    Application {
        failure_type: String,
        non_retryable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    /// A cancellation scope was cancelled.
    Canceled {
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    Timeout {
        timeout_type: TimeoutType,
    },
    /// Wrapper for a failed, timed out or cancelled activity.
    Activity {
        activity_id: String,
        activity_type: String,
        scheduled_event_id: i64,
    },
    /// Wrapper for a failed, timed out, cancelled or terminated child workflow.
    ChildWorkflowExecution {
        workflow_id: String,
        workflow_type: String,
        initiated_event_id: i64,
    },
    Terminated,
}

impl Failure {
    pub fn application(
        failure_type: impl Into<String>,
        message: impl Into<String>,
        non_retryable: bool,
        details: Option<Value>,
    ) -> Self {
        Self {
            message: message.into(),
            cause: None,
            info: FailureInfo::Application {
                failure_type: failure_type.into(),
                non_retryable,
                details,
            },
        }
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            info: FailureInfo::Canceled { details: None },
        }
    }

    pub fn timeout(timeout_type: TimeoutType) -> Self {
        Self {
            message: format!("operation timed out: {timeout_type:?}"),
            cause: None,
            info: FailureInfo::Timeout { timeout_type },
        }
    }

    pub fn terminated(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            info: FailureInfo::Terminated,
        }
    }

    pub fn with_cause(mut self, cause: Failure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// True if this failure or any failure in its cause chain is a cancellation.
    pub fn is_canceled(&self) -> bool {
        if matches!(self.info, FailureInfo::Canceled { .. }) {
            return true;
        }
        self.cause.as_deref().is_some_and(Failure::is_canceled)
    }

    /// The application failure type of this failure or its nearest
    /// application cause, used by retry policies.
    pub fn application_type(&self) -> Option<&str> {
        if let FailureInfo::Application { failure_type, .. } = &self.info {
            return Some(failure_type);
        }
        self.cause.as_deref().and_then(Failure::application_type)
    }

    /// True if an application failure in the chain is flagged non-retryable.
    pub fn is_non_retryable(&self) -> bool {
        if let FailureInfo::Application { non_retryable, .. } = &self.info {
            if *non_retryable {
                return true;
            }
        }
        self.cause.as_deref().is_some_and(Failure::is_non_retryable)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}
