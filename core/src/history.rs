//! History event model for workflow replay.
//!
//! A history event is an immutable record persisted by the service. A subset
//! are *command events*: events generated by a prior command of this
//! workflow, which must align one-to-one with the command queue during
//! replay. The remainder are external events (signals, cancel requests,
//! workflow-task lifecycle).

use crate::command::{
    ContinueAsNewWorkflowExecutionAttributes, RecordMarkerAttributes,
    RequestCancelExternalWorkflowExecutionAttributes, ScheduleActivityTaskAttributes,
    SignalExternalWorkflowExecutionAttributes, StartChildWorkflowExecutionAttributes,
    StartTimerAttributes, UpsertWorkflowSearchAttributesAttributes,
};
use crate::failure::{Failure, TimeoutType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event types that can appear in a workflow history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    WorkflowExecutionTimedOut,
    WorkflowExecutionCanceled,
    WorkflowExecutionTerminated,
    WorkflowExecutionContinuedAsNew,
    WorkflowExecutionSignaled,
    WorkflowExecutionCancelRequested,
    WorkflowTaskScheduled,
    WorkflowTaskStarted,
    WorkflowTaskCompleted,
    WorkflowTaskFailed,
    WorkflowTaskTimedOut,
    ActivityTaskScheduled,
    ActivityTaskStarted,
    ActivityTaskCompleted,
    ActivityTaskFailed,
    ActivityTaskTimedOut,
    ActivityTaskCancelRequested,
    ActivityTaskCanceled,
    TimerStarted,
    TimerFired,
    TimerCanceled,
    MarkerRecorded,
    StartChildWorkflowExecutionInitiated,
    StartChildWorkflowExecutionFailed,
    ChildWorkflowExecutionStarted,
    ChildWorkflowExecutionCompleted,
    ChildWorkflowExecutionFailed,
    ChildWorkflowExecutionCanceled,
    ChildWorkflowExecutionTimedOut,
    ChildWorkflowExecutionTerminated,
    SignalExternalWorkflowExecutionInitiated,
    SignalExternalWorkflowExecutionFailed,
    ExternalWorkflowExecutionSignaled,
    RequestCancelExternalWorkflowExecutionInitiated,
    RequestCancelExternalWorkflowExecutionFailed,
    ExternalWorkflowExecutionCancelRequested,
    UpsertWorkflowSearchAttributes,
}

impl EventType {
    /// True for events generated by a command of this workflow. Command
    /// events must align one-to-one with the command queue during replay.
    pub fn is_command_event(&self) -> bool {
        matches!(
            self,
            Self::ActivityTaskScheduled
                | Self::ActivityTaskCancelRequested
                | Self::TimerStarted
                | Self::TimerCanceled
                | Self::MarkerRecorded
                | Self::StartChildWorkflowExecutionInitiated
                | Self::SignalExternalWorkflowExecutionInitiated
                | Self::RequestCancelExternalWorkflowExecutionInitiated
                | Self::WorkflowExecutionCompleted
                | Self::WorkflowExecutionFailed
                | Self::WorkflowExecutionCanceled
                | Self::WorkflowExecutionContinuedAsNew
                | Self::UpsertWorkflowSearchAttributes
        )
    }
}

/// Cause reported on a failed child workflow start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartChildWorkflowExecutionFailedCause {
    WorkflowAlreadyExists,
    NamespaceNotFound,
}

/// Identity of a started child workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
}

/// Type-specific attribute payload of a history event.
///
/// Command events embed the same attribute structs as the command that
/// produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        workflow_id: String,
        workflow_type: String,
        original_execution_run_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    WorkflowExecutionCompleted {
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    WorkflowExecutionFailed {
        failure: Failure,
    },
    WorkflowExecutionTimedOut,
    WorkflowExecutionCanceled {
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    WorkflowExecutionTerminated {
        reason: String,
    },
    WorkflowExecutionContinuedAsNew(ContinueAsNewWorkflowExecutionAttributes),
    WorkflowExecutionSignaled {
        signal_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    WorkflowExecutionCancelRequested {
        cause: String,
    },
    WorkflowTaskScheduled,
    WorkflowTaskStarted {
        scheduled_event_id: i64,
    },
    WorkflowTaskCompleted {
        scheduled_event_id: i64,
        started_event_id: i64,
    },
    WorkflowTaskFailed {
        scheduled_event_id: i64,
        started_event_id: i64,
        cause: String,
    },
    WorkflowTaskTimedOut {
        scheduled_event_id: i64,
        started_event_id: i64,
    },
    ActivityTaskScheduled(ScheduleActivityTaskAttributes),
    ActivityTaskStarted {
        scheduled_event_id: i64,
        attempt: i32,
    },
    ActivityTaskCompleted {
        scheduled_event_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    ActivityTaskFailed {
        scheduled_event_id: i64,
        failure: Failure,
    },
    ActivityTaskTimedOut {
        scheduled_event_id: i64,
        failure: Failure,
    },
    ActivityTaskCancelRequested {
        scheduled_event_id: i64,
    },
    ActivityTaskCanceled {
        scheduled_event_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    TimerStarted(StartTimerAttributes),
    TimerFired {
        timer_id: String,
        started_event_id: i64,
    },
    TimerCanceled {
        timer_id: String,
        started_event_id: i64,
    },
    MarkerRecorded(RecordMarkerAttributes),
    StartChildWorkflowExecutionInitiated(StartChildWorkflowExecutionAttributes),
    StartChildWorkflowExecutionFailed {
        initiated_event_id: i64,
        workflow_id: String,
        workflow_type: String,
        cause: StartChildWorkflowExecutionFailedCause,
    },
    ChildWorkflowExecutionStarted {
        initiated_event_id: i64,
        workflow_execution: WorkflowExecution,
    },
    ChildWorkflowExecutionCompleted {
        initiated_event_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    ChildWorkflowExecutionFailed {
        initiated_event_id: i64,
        failure: Failure,
    },
    ChildWorkflowExecutionCanceled {
        initiated_event_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    ChildWorkflowExecutionTimedOut {
        initiated_event_id: i64,
        timeout_type: TimeoutType,
    },
    ChildWorkflowExecutionTerminated {
        initiated_event_id: i64,
    },
    SignalExternalWorkflowExecutionInitiated(SignalExternalWorkflowExecutionAttributes),
    SignalExternalWorkflowExecutionFailed {
        initiated_event_id: i64,
        workflow_id: String,
        cause: String,
    },
    ExternalWorkflowExecutionSignaled {
        initiated_event_id: i64,
        workflow_id: String,
    },
    RequestCancelExternalWorkflowExecutionInitiated(
        RequestCancelExternalWorkflowExecutionAttributes,
    ),
    RequestCancelExternalWorkflowExecutionFailed {
        initiated_event_id: i64,
        workflow_id: String,
        cause: String,
    },
    ExternalWorkflowExecutionCancelRequested {
        initiated_event_id: i64,
        workflow_id: String,
    },
    UpsertWorkflowSearchAttributes(UpsertWorkflowSearchAttributesAttributes),
}

impl EventAttributes {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::WorkflowExecutionStarted { .. } => EventType::WorkflowExecutionStarted,
            Self::WorkflowExecutionCompleted { .. } => EventType::WorkflowExecutionCompleted,
            Self::WorkflowExecutionFailed { .. } => EventType::WorkflowExecutionFailed,
            Self::WorkflowExecutionTimedOut => EventType::WorkflowExecutionTimedOut,
            Self::WorkflowExecutionCanceled { .. } => EventType::WorkflowExecutionCanceled,
            Self::WorkflowExecutionTerminated { .. } => EventType::WorkflowExecutionTerminated,
            Self::WorkflowExecutionContinuedAsNew(_) => EventType::WorkflowExecutionContinuedAsNew,
            Self::WorkflowExecutionSignaled { .. } => EventType::WorkflowExecutionSignaled,
            Self::WorkflowExecutionCancelRequested { .. } => {
                EventType::WorkflowExecutionCancelRequested
            }
            Self::WorkflowTaskScheduled => EventType::WorkflowTaskScheduled,
            Self::WorkflowTaskStarted { .. } => EventType::WorkflowTaskStarted,
            Self::WorkflowTaskCompleted { .. } => EventType::WorkflowTaskCompleted,
            Self::WorkflowTaskFailed { .. } => EventType::WorkflowTaskFailed,
            Self::WorkflowTaskTimedOut { .. } => EventType::WorkflowTaskTimedOut,
            Self::ActivityTaskScheduled(_) => EventType::ActivityTaskScheduled,
            Self::ActivityTaskStarted { .. } => EventType::ActivityTaskStarted,
            Self::ActivityTaskCompleted { .. } => EventType::ActivityTaskCompleted,
            Self::ActivityTaskFailed { .. } => EventType::ActivityTaskFailed,
            Self::ActivityTaskTimedOut { .. } => EventType::ActivityTaskTimedOut,
            Self::ActivityTaskCancelRequested { .. } => EventType::ActivityTaskCancelRequested,
            Self::ActivityTaskCanceled { .. } => EventType::ActivityTaskCanceled,
            Self::TimerStarted(_) => EventType::TimerStarted,
            Self::TimerFired { .. } => EventType::TimerFired,
            Self::TimerCanceled { .. } => EventType::TimerCanceled,
            Self::MarkerRecorded(_) => EventType::MarkerRecorded,
            Self::StartChildWorkflowExecutionInitiated(_) => {
                EventType::StartChildWorkflowExecutionInitiated
            }
            Self::StartChildWorkflowExecutionFailed { .. } => {
                EventType::StartChildWorkflowExecutionFailed
            }
            Self::ChildWorkflowExecutionStarted { .. } => EventType::ChildWorkflowExecutionStarted,
            Self::ChildWorkflowExecutionCompleted { .. } => {
                EventType::ChildWorkflowExecutionCompleted
            }
            Self::ChildWorkflowExecutionFailed { .. } => EventType::ChildWorkflowExecutionFailed,
            Self::ChildWorkflowExecutionCanceled { .. } => {
                EventType::ChildWorkflowExecutionCanceled
            }
            Self::ChildWorkflowExecutionTimedOut { .. } => {
                EventType::ChildWorkflowExecutionTimedOut
            }
            Self::ChildWorkflowExecutionTerminated { .. } => {
                EventType::ChildWorkflowExecutionTerminated
            }
            Self::SignalExternalWorkflowExecutionInitiated(_) => {
                EventType::SignalExternalWorkflowExecutionInitiated
            }
            Self::SignalExternalWorkflowExecutionFailed { .. } => {
                EventType::SignalExternalWorkflowExecutionFailed
            }
            Self::ExternalWorkflowExecutionSignaled { .. } => {
                EventType::ExternalWorkflowExecutionSignaled
            }
            Self::RequestCancelExternalWorkflowExecutionInitiated(_) => {
                EventType::RequestCancelExternalWorkflowExecutionInitiated
            }
            Self::RequestCancelExternalWorkflowExecutionFailed { .. } => {
                EventType::RequestCancelExternalWorkflowExecutionFailed
            }
            Self::ExternalWorkflowExecutionCancelRequested { .. } => {
                EventType::ExternalWorkflowExecutionCancelRequested
            }
            Self::UpsertWorkflowSearchAttributes(_) => EventType::UpsertWorkflowSearchAttributes,
        }
    }
}

/// An immutable record from the workflow history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    pub event_id: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    pub fn new(event_id: i64, timestamp: DateTime<Utc>, attributes: EventAttributes) -> Self {
        Self {
            event_id,
            timestamp,
            attributes,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.attributes.event_type()
    }

    pub fn is_command_event(&self) -> bool {
        self.event_type().is_command_event()
    }

    /// Event id of the `scheduled`/`started`/`initiated` event that this
    /// event refers back to. Events that are themselves initiating (or carry
    /// no reference) route by their own id.
    pub fn initial_command_event_id(&self) -> i64 {
        use EventAttributes as A;
        match &self.attributes {
            A::ActivityTaskStarted {
                scheduled_event_id, ..
            }
            | A::ActivityTaskCompleted {
                scheduled_event_id, ..
            }
            | A::ActivityTaskFailed {
                scheduled_event_id, ..
            }
            | A::ActivityTaskTimedOut {
                scheduled_event_id, ..
            }
            | A::ActivityTaskCancelRequested { scheduled_event_id }
            | A::ActivityTaskCanceled {
                scheduled_event_id, ..
            } => *scheduled_event_id,
            A::TimerFired {
                started_event_id, ..
            }
            | A::TimerCanceled {
                started_event_id, ..
            } => *started_event_id,
            A::StartChildWorkflowExecutionFailed {
                initiated_event_id, ..
            }
            | A::ChildWorkflowExecutionStarted {
                initiated_event_id, ..
            }
            | A::ChildWorkflowExecutionCompleted {
                initiated_event_id, ..
            }
            | A::ChildWorkflowExecutionFailed {
                initiated_event_id, ..
            }
            | A::ChildWorkflowExecutionCanceled {
                initiated_event_id, ..
            }
            | A::ChildWorkflowExecutionTimedOut {
                initiated_event_id, ..
            }
            | A::ChildWorkflowExecutionTerminated { initiated_event_id }
            | A::SignalExternalWorkflowExecutionFailed {
                initiated_event_id, ..
            }
            | A::ExternalWorkflowExecutionSignaled {
                initiated_event_id, ..
            }
            | A::RequestCancelExternalWorkflowExecutionFailed {
                initiated_event_id, ..
            }
            | A::ExternalWorkflowExecutionCancelRequested {
                initiated_event_id, ..
            } => *initiated_event_id,
            A::WorkflowTaskStarted { scheduled_event_id }
            | A::WorkflowTaskCompleted {
                scheduled_event_id, ..
            }
            | A::WorkflowTaskFailed {
                scheduled_event_id, ..
            }
            | A::WorkflowTaskTimedOut {
                scheduled_event_id, ..
            } => *scheduled_event_id,
            A::WorkflowExecutionStarted { .. }
            | A::WorkflowExecutionCompleted { .. }
            | A::WorkflowExecutionFailed { .. }
            | A::WorkflowExecutionTimedOut
            | A::WorkflowExecutionCanceled { .. }
            | A::WorkflowExecutionTerminated { .. }
            | A::WorkflowExecutionContinuedAsNew(_)
            | A::WorkflowExecutionSignaled { .. }
            | A::WorkflowExecutionCancelRequested { .. }
            | A::WorkflowTaskScheduled
            | A::ActivityTaskScheduled(_)
            | A::TimerStarted(_)
            | A::MarkerRecorded(_)
            | A::StartChildWorkflowExecutionInitiated(_)
            | A::SignalExternalWorkflowExecutionInitiated(_)
            | A::RequestCancelExternalWorkflowExecutionInitiated(_)
            | A::UpsertWorkflowSearchAttributes(_) => self.event_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(attributes: EventAttributes) -> HistoryEvent {
        HistoryEvent::new(7, Utc::now(), attributes)
    }

    #[test]
    fn test_command_event_classification() {
        assert!(EventType::ActivityTaskScheduled.is_command_event());
        assert!(EventType::TimerStarted.is_command_event());
        assert!(EventType::TimerCanceled.is_command_event());
        assert!(EventType::MarkerRecorded.is_command_event());
        assert!(EventType::WorkflowExecutionCompleted.is_command_event());
        assert!(EventType::ActivityTaskCancelRequested.is_command_event());

        assert!(!EventType::WorkflowExecutionStarted.is_command_event());
        assert!(!EventType::WorkflowTaskStarted.is_command_event());
        assert!(!EventType::TimerFired.is_command_event());
        assert!(!EventType::WorkflowExecutionSignaled.is_command_event());
    }

    #[test]
    fn test_initial_command_event_id_for_referencing_events() {
        let fired = event(EventAttributes::TimerFired {
            timer_id: "1".to_string(),
            started_event_id: 5,
        });
        assert_eq!(fired.initial_command_event_id(), 5);

        let completed = event(EventAttributes::ActivityTaskCompleted {
            scheduled_event_id: 12,
            result: None,
        });
        assert_eq!(completed.initial_command_event_id(), 12);

        let started = event(EventAttributes::WorkflowTaskStarted {
            scheduled_event_id: 2,
        });
        assert_eq!(started.initial_command_event_id(), 2);
    }

    #[test]
    fn test_initial_command_event_id_for_initiating_events() {
        let signaled = event(EventAttributes::WorkflowExecutionSignaled {
            signal_name: "go".to_string(),
            input: None,
        });
        assert_eq!(signaled.initial_command_event_id(), 7);
    }

    #[test]
    fn test_event_type_derived_from_attributes() {
        let marker = event(EventAttributes::MarkerRecorded(RecordMarkerAttributes {
            marker_name: "Version".to_string(),
            details: Default::default(),
            failure: None,
        }));
        assert_eq!(marker.event_type(), EventType::MarkerRecorded);
        assert!(marker.is_command_event());
    }

    #[test]
    fn test_history_event_serde_round_trip() {
        let started = event(EventAttributes::WorkflowExecutionStarted {
            workflow_id: "wf-1".to_string(),
            workflow_type: "greeter".to_string(),
            original_execution_run_id: "run-1".to_string(),
            input: Some(serde_json::json!("hi")),
        });
        let encoded = serde_json::to_string(&started).unwrap();
        assert!(encoded.contains("\"eventType\":\"WORKFLOW_EXECUTION_STARTED\""));
        assert!(encoded.contains("\"eventId\":7"));
        let decoded: HistoryEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, started);
    }
}
