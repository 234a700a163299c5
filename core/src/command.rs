//! Commands emitted by the replay engine towards the orchestration service.
//!
//! Every non-marker command later produces exactly one matching command event
//! in history; the attribute structs here are shared with the corresponding
//! initiating events so that command/event cross-checks compare like with
//! like.

use crate::failure::Failure;
use crate::history::EventType;
use crate::retry::RetryOptions;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    ScheduleActivityTask,
    RequestCancelActivityTask,
    StartTimer,
    CancelTimer,
    CompleteWorkflowExecution,
    FailWorkflowExecution,
    CancelWorkflowExecution,
    ContinueAsNewWorkflowExecution,
    StartChildWorkflowExecution,
    SignalExternalWorkflowExecution,
    RequestCancelExternalWorkflowExecution,
    RecordMarker,
    UpsertWorkflowSearchAttributes,
}

impl CommandType {
    /// The command event this command produces in history.
    pub fn expected_event_type(&self) -> EventType {
        match self {
            Self::ScheduleActivityTask => EventType::ActivityTaskScheduled,
            Self::RequestCancelActivityTask => EventType::ActivityTaskCancelRequested,
            Self::StartTimer => EventType::TimerStarted,
            Self::CancelTimer => EventType::TimerCanceled,
            Self::CompleteWorkflowExecution => EventType::WorkflowExecutionCompleted,
            Self::FailWorkflowExecution => EventType::WorkflowExecutionFailed,
            Self::CancelWorkflowExecution => EventType::WorkflowExecutionCanceled,
            Self::ContinueAsNewWorkflowExecution => EventType::WorkflowExecutionContinuedAsNew,
            Self::StartChildWorkflowExecution => EventType::StartChildWorkflowExecutionInitiated,
            Self::SignalExternalWorkflowExecution => {
                EventType::SignalExternalWorkflowExecutionInitiated
            }
            Self::RequestCancelExternalWorkflowExecution => {
                EventType::RequestCancelExternalWorkflowExecutionInitiated
            }
            Self::RecordMarker => EventType::MarkerRecorded,
            Self::UpsertWorkflowSearchAttributes => EventType::UpsertWorkflowSearchAttributes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleActivityTaskAttributes {
    pub activity_id: String,
    pub activity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_to_close_timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_to_start_timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_to_close_timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_options: Option<RetryOptions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTimerAttributes {
    pub timer_id: String,
    pub start_to_fire_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMarkerAttributes {
    pub marker_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartChildWorkflowExecutionAttributes {
    pub workflow_id: String,
    pub workflow_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SignalExternalWorkflowExecutionAttributes {
    pub workflow_id: String,
    pub signal_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    pub child_workflow_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RequestCancelExternalWorkflowExecutionAttributes {
    pub workflow_id: String,
    pub child_workflow_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContinueAsNewWorkflowExecutionAttributes {
    pub workflow_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpsertWorkflowSearchAttributesAttributes {
    pub search_attributes: BTreeMap<String, Value>,
}

/// A command plus its type-specific attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "commandType", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum CommandAttributes {
    ScheduleActivityTask(ScheduleActivityTaskAttributes),
    RequestCancelActivityTask {
        scheduled_event_id: i64,
    },
    StartTimer(StartTimerAttributes),
    CancelTimer {
        timer_id: String,
    },
    CompleteWorkflowExecution {
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    FailWorkflowExecution {
        failure: Failure,
    },
    CancelWorkflowExecution {
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    ContinueAsNewWorkflowExecution(ContinueAsNewWorkflowExecutionAttributes),
    StartChildWorkflowExecution(StartChildWorkflowExecutionAttributes),
    SignalExternalWorkflowExecution(SignalExternalWorkflowExecutionAttributes),
    RequestCancelExternalWorkflowExecution(RequestCancelExternalWorkflowExecutionAttributes),
    RecordMarker(RecordMarkerAttributes),
    UpsertWorkflowSearchAttributes(UpsertWorkflowSearchAttributesAttributes),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(flatten)]
    pub attributes: CommandAttributes,
}

impl Command {
    pub fn new(attributes: CommandAttributes) -> Self {
        Self { attributes }
    }

    pub fn command_type(&self) -> CommandType {
        match &self.attributes {
            CommandAttributes::ScheduleActivityTask(_) => CommandType::ScheduleActivityTask,
            CommandAttributes::RequestCancelActivityTask { .. } => {
                CommandType::RequestCancelActivityTask
            }
            CommandAttributes::StartTimer(_) => CommandType::StartTimer,
            CommandAttributes::CancelTimer { .. } => CommandType::CancelTimer,
            CommandAttributes::CompleteWorkflowExecution { .. } => {
                CommandType::CompleteWorkflowExecution
            }
            CommandAttributes::FailWorkflowExecution { .. } => CommandType::FailWorkflowExecution,
            CommandAttributes::CancelWorkflowExecution { .. } => {
                CommandType::CancelWorkflowExecution
            }
            CommandAttributes::ContinueAsNewWorkflowExecution(_) => {
                CommandType::ContinueAsNewWorkflowExecution
            }
            CommandAttributes::StartChildWorkflowExecution(_) => {
                CommandType::StartChildWorkflowExecution
            }
            CommandAttributes::SignalExternalWorkflowExecution(_) => {
                CommandType::SignalExternalWorkflowExecution
            }
            CommandAttributes::RequestCancelExternalWorkflowExecution(_) => {
                CommandType::RequestCancelExternalWorkflowExecution
            }
            CommandAttributes::RecordMarker(_) => CommandType::RecordMarker,
            CommandAttributes::UpsertWorkflowSearchAttributes(_) => {
                CommandType::UpsertWorkflowSearchAttributes
            }
        }
    }

    pub fn expected_event_type(&self) -> EventType {
        self.command_type().expected_event_type()
    }
}
