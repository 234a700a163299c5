//! Workflow task machine.
//!
//! Tracks one workflow-task attempt through scheduled/started/closed. The
//! started notification is the trigger that advances the coordinator's
//! current-started-event id and releases queued commands to the
//! command-preparation phase. For replayed tasks the notification is
//! deferred until the task's completed event, so that the whole
//! started/completed/command-events sequence is processed with a consistent
//! replay flag; for the task being executed right now (the started event is
//! the last one available) it fires immediately.

use super::{EffectBuffer, EntityStateMachine, HandleEventStatus, MachineEffects};
use crate::command::CommandType;
use crate::error::CoreResult;
use crate::history::{EventAttributes, HistoryEvent};
use std::sync::Arc;

/// Payload of the started notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkflowTaskStartedNotification {
    pub started_event_id: i64,
    pub current_time_millis: i64,
    /// True when this workflow task was never processed before: the worker
    /// is executing it now rather than replaying its completion.
    pub non_processed_workflow_task: bool,
}

type StartedListener = Arc<dyn Fn(WorkflowTaskStartedNotification) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Scheduled,
    Started,
    Completed,
    Failed,
    TimedOut,
}

pub(crate) struct WorkflowTaskMachine {
    listener: StartedListener,
    state: State,
    started_event_id: i64,
    started_time_millis: i64,
    deferred: bool,
    out: EffectBuffer,
}

impl WorkflowTaskMachine {
    pub fn new(listener: StartedListener) -> Self {
        Self {
            listener,
            state: State::Created,
            started_event_id: 0,
            started_time_millis: 0,
            deferred: false,
            out: EffectBuffer::default(),
        }
    }

    fn emit_started(&mut self, non_processed_workflow_task: bool) {
        let listener = self.listener.clone();
        let notification = WorkflowTaskStartedNotification {
            started_event_id: self.started_event_id,
            current_time_millis: self.started_time_millis,
            non_processed_workflow_task,
        };
        self.out.callback(move || listener(notification));
    }
}

impl EntityStateMachine for WorkflowTaskMachine {
    fn name(&self) -> &'static str {
        "WorkflowTask"
    }

    fn handle_event(
        &mut self,
        event: &HistoryEvent,
        has_next: bool,
    ) -> CoreResult<HandleEventStatus> {
        match (&event.attributes, self.state) {
            (EventAttributes::WorkflowTaskScheduled, State::Created) => {
                self.state = State::Scheduled;
                Ok(HandleEventStatus::Matched)
            }
            (EventAttributes::WorkflowTaskStarted { .. }, State::Scheduled) => {
                self.state = State::Started;
                self.started_event_id = event.event_id;
                self.started_time_millis = event.timestamp.timestamp_millis();
                if !has_next {
                    // The task being executed right now.
                    self.emit_started(true);
                } else {
                    self.deferred = true;
                }
                Ok(HandleEventStatus::Matched)
            }
            (EventAttributes::WorkflowTaskCompleted { .. }, State::Started) => {
                self.state = State::Completed;
                if self.deferred {
                    self.deferred = false;
                    self.emit_started(false);
                }
                Ok(HandleEventStatus::Matched)
            }
            (EventAttributes::WorkflowTaskFailed { .. }, State::Started) => {
                // Failed attempt: its started notification must never fire.
                self.state = State::Failed;
                self.deferred = false;
                Ok(HandleEventStatus::Matched)
            }
            (EventAttributes::WorkflowTaskTimedOut { .. }, State::Started) => {
                self.state = State::TimedOut;
                self.deferred = false;
                Ok(HandleEventStatus::Matched)
            }
            _ => Ok(HandleEventStatus::NonMatching),
        }
    }

    fn handle_command(&mut self, _command_type: CommandType) {}

    fn is_final_state(&self) -> bool {
        matches!(self.state, State::Completed | State::Failed | State::TimedOut)
    }

    fn take_effects(&mut self) -> MachineEffects {
        self.out.take()
    }
}
