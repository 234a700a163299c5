//! Local activity machine.
//!
//! The only machine whose scheduling does not immediately enqueue a command:
//! execution requests go to the local dispatch sink, and a marker command is
//! appended only when the activity completes. During replay, matching is by
//! `activity_id` rather than by next-command position; the coordinator routes
//! local-activity markers here before the regular command matching runs.

use super::{EffectBuffer, EntityStateMachine, HandleEventStatus, LocalActivityCallback, MachineEffects};
use crate::command::{Command, CommandAttributes, CommandType};
use crate::error::CoreResult;
use crate::failure::Failure;
use crate::history::HistoryEvent;
use crate::markers::{self, LocalActivityMarkerData};
use crate::retry::RetryOptions;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Parameters handed to the transport for local dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteLocalActivityParameters {
    pub activity_id: String,
    pub activity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_options: Option<RetryOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_to_close_timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_to_close_timeout: Option<Duration>,
}

/// Final outcome of one local activity execution, reported by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalActivityExecutionResult {
    pub activity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    pub attempt: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Duration>,
}

/// Outcome delivered to the local-activity completion callback.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalActivityResolution {
    Completed { result: Option<Value> },
    Failed { failure: Failure },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalActivityState {
    RequestPrepared,
    RequestSent,
    WaitingMarkerEvent,
    MarkerCommandCreated,
    ResultNotified,
    MarkerCommandRecorded,
    Canceled,
}

pub(crate) struct LocalActivityMachine {
    parameters: ExecuteLocalActivityParameters,
    state: LocalActivityState,
    callback: Option<LocalActivityCallback>,
    pending_resolution: Option<LocalActivityResolution>,
    out: EffectBuffer,
}

impl LocalActivityMachine {
    pub fn new(
        parameters: ExecuteLocalActivityParameters,
        callback: LocalActivityCallback,
        replaying: bool,
    ) -> Self {
        let state = if replaying {
            LocalActivityState::WaitingMarkerEvent
        } else {
            LocalActivityState::RequestPrepared
        };
        let mut machine = Self {
            parameters,
            state,
            callback: Some(callback),
            pending_resolution: None,
            out: EffectBuffer::default(),
        };
        if state == LocalActivityState::RequestPrepared {
            machine.out.request_local_activity(machine.parameters.clone());
        }
        machine
    }

    pub fn state(&self) -> LocalActivityState {
        self.state
    }

    pub fn activity_id(&self) -> &str {
        &self.parameters.activity_id
    }

    /// The request left through `take_local_activity_requests`.
    pub fn mark_as_sent(&mut self) {
        if self.state == LocalActivityState::RequestPrepared {
            self.state = LocalActivityState::RequestSent;
        }
    }

    /// Final completion from the local worker: record the marker command and
    /// hold the resolution until the command is prepared.
    pub fn handle_completion(
        &mut self,
        result: LocalActivityExecutionResult,
        current_time_millis: i64,
    ) {
        if !matches!(
            self.state,
            LocalActivityState::RequestPrepared | LocalActivityState::RequestSent
        ) {
            return;
        }
        let resolution = match &result.failure {
            Some(failure) => LocalActivityResolution::Failed {
                failure: failure.clone(),
            },
            None => LocalActivityResolution::Completed {
                result: result.result.clone(),
            },
        };
        let marker = LocalActivityMarkerData {
            activity_id: self.parameters.activity_id.clone(),
            activity_type: self.parameters.activity_type.clone(),
            result: result.result,
            failure: result.failure,
            replay_time_millis: current_time_millis,
            attempt: result.attempt,
            backoff: result.backoff,
        };
        self.out
            .add_command(Command::new(CommandAttributes::RecordMarker(
                marker.into_marker(),
            )));
        self.pending_resolution = Some(resolution);
        self.state = LocalActivityState::MarkerCommandCreated;
    }

    /// Re-dispatch the request if it was lost to a force-failed workflow
    /// task.
    pub fn non_replay_workflow_task_started(&mut self) {
        if self.state == LocalActivityState::RequestSent {
            self.out.request_local_activity(self.parameters.clone());
            self.state = LocalActivityState::RequestPrepared;
        }
    }

    pub fn cancel(&mut self) {
        if matches!(
            self.state,
            LocalActivityState::RequestPrepared
                | LocalActivityState::RequestSent
                | LocalActivityState::WaitingMarkerEvent
        ) {
            if let Some(callback) = self.callback.take() {
                let failure = Failure::canceled("local activity cancelled");
                self.out
                    .callback(move || callback(LocalActivityResolution::Failed { failure }));
            }
            self.state = LocalActivityState::Canceled;
        }
    }
}

impl EntityStateMachine for LocalActivityMachine {
    fn name(&self) -> &'static str {
        "LocalActivity"
    }

    fn handle_event(
        &mut self,
        event: &HistoryEvent,
        _has_next: bool,
    ) -> CoreResult<HandleEventStatus> {
        let Some(attributes) = markers::marker_attributes(event) else {
            return Ok(HandleEventStatus::NonMatching);
        };
        let Some(marker) = LocalActivityMarkerData::from_marker(attributes) else {
            return Ok(HandleEventStatus::NonMatching);
        };
        if marker.activity_id != self.parameters.activity_id {
            return Ok(HandleEventStatus::NonMatching);
        }
        match self.state {
            LocalActivityState::WaitingMarkerEvent => {
                let resolution = match marker.failure {
                    Some(failure) => LocalActivityResolution::Failed { failure },
                    None => LocalActivityResolution::Completed {
                        result: marker.result,
                    },
                };
                if let Some(callback) = self.callback.take() {
                    self.out.callback(move || callback(resolution));
                }
                self.state = LocalActivityState::MarkerCommandRecorded;
                Ok(HandleEventStatus::Matched)
            }
            LocalActivityState::ResultNotified => {
                self.state = LocalActivityState::MarkerCommandRecorded;
                Ok(HandleEventStatus::Matched)
            }
            _ => Ok(HandleEventStatus::NonMatching),
        }
    }

    fn handle_command(&mut self, command_type: CommandType) {
        if command_type != CommandType::RecordMarker {
            return;
        }
        if self.state == LocalActivityState::MarkerCommandCreated {
            if let Some(callback) = self.callback.take() {
                if let Some(resolution) = self.pending_resolution.take() {
                    self.out.callback(move || callback(resolution));
                }
            }
            self.state = LocalActivityState::ResultNotified;
        }
    }

    fn is_final_state(&self) -> bool {
        matches!(
            self.state,
            LocalActivityState::MarkerCommandRecorded | LocalActivityState::Canceled
        )
    }

    fn take_effects(&mut self) -> MachineEffects {
        self.out.take()
    }
}
