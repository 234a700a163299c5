//! Child workflow execution machine.
//!
//! Two callbacks: one when the child starts remotely, one on completion. The
//! completion slot is shared with the coordinator so that the cancellation
//! path can resolve it without going through the machine (ABANDON and
//! TRY_CANCEL notify before any terminal event arrives). Both sides take
//! from the same slot, so the callback still fires at most once.

use super::definition::{Machine, StateMachineDefinition, StateMachineSink, Trigger};
use super::{ChildCompletionCallback, ChildStartedCallback, EffectBuffer, MachineData};
use crate::command::{
    Command, CommandAttributes, CommandType, StartChildWorkflowExecutionAttributes,
};
use crate::error::CoreResult;
use crate::failure::{Failure, TimeoutType};
use crate::history::{
    EventAttributes, EventType, HistoryEvent, StartChildWorkflowExecutionFailedCause,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, OnceLock};

/// Governs when a cancelled child resolves its completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChildWorkflowCancellationType {
    /// Do not request cancellation; resolve as cancelled immediately.
    Abandon,
    /// Request cancellation and resolve as cancelled without waiting.
    TryCancel,
    /// Resolve once the cancel request is recorded by the service.
    WaitCancellationRequested,
    /// Resolve only when the child reaches a terminal event.
    #[default]
    WaitCancellationCompleted,
}

/// Outcome delivered to the child-workflow completion callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildWorkflowResolution {
    Completed {
        result: Option<Value>,
    },
    Failed {
        failure: Failure,
    },
    Canceled {
        details: Option<Value>,
    },
    TimedOut {
        timeout_type: TimeoutType,
    },
    Terminated,
    StartFailed {
        workflow_id: String,
        workflow_type: String,
        cause: StartChildWorkflowExecutionFailedCause,
    },
}

pub(crate) type SharedChildCompletion = Arc<Mutex<Option<ChildCompletionCallback>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum State {
    Created,
    StartCommandCreated,
    InitiatedEventRecorded,
    StartedEventRecorded,
    Completed,
    Failed,
    Canceled,
    TimedOut,
    Terminated,
    StartFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Explicit {
    Schedule,
    Cancel,
}

pub(crate) struct ChildWorkflowData {
    attributes: StartChildWorkflowExecutionAttributes,
    started: Option<ChildStartedCallback>,
    completion: SharedChildCompletion,
    current_event: Option<HistoryEvent>,
    out: EffectBuffer,
}

impl ChildWorkflowData {
    fn notify(&mut self, resolution: ChildWorkflowResolution) {
        let slot = self.completion.clone();
        self.out.callback(move || {
            if let Some(callback) = slot.lock().take() {
                callback(resolution);
            }
        });
    }

    fn notify_started(&mut self) {
        let execution = match self.current_event.as_ref().map(|e| &e.attributes) {
            Some(EventAttributes::ChildWorkflowExecutionStarted {
                workflow_execution, ..
            }) => workflow_execution.clone(),
            _ => return,
        };
        if let Some(callback) = self.started.take() {
            self.out.callback(move || callback(execution));
        }
    }

    fn notify_from_terminal_event(&mut self) {
        let resolution = match self.current_event.as_ref().map(|e| &e.attributes) {
            Some(EventAttributes::ChildWorkflowExecutionCompleted { result, .. }) => {
                ChildWorkflowResolution::Completed {
                    result: result.clone(),
                }
            }
            Some(EventAttributes::ChildWorkflowExecutionFailed { failure, .. }) => {
                ChildWorkflowResolution::Failed {
                    failure: failure.clone(),
                }
            }
            Some(EventAttributes::ChildWorkflowExecutionCanceled { details, .. }) => {
                ChildWorkflowResolution::Canceled {
                    details: details.clone(),
                }
            }
            Some(EventAttributes::ChildWorkflowExecutionTimedOut { timeout_type, .. }) => {
                ChildWorkflowResolution::TimedOut {
                    timeout_type: *timeout_type,
                }
            }
            Some(EventAttributes::ChildWorkflowExecutionTerminated { .. }) => {
                ChildWorkflowResolution::Terminated
            }
            Some(EventAttributes::StartChildWorkflowExecutionFailed {
                workflow_id,
                workflow_type,
                cause,
                ..
            }) => ChildWorkflowResolution::StartFailed {
                workflow_id: workflow_id.clone(),
                workflow_type: workflow_type.clone(),
                cause: *cause,
            },
            _ => return,
        };
        self.notify(resolution);
    }
}

impl MachineData for ChildWorkflowData {
    fn out(&mut self) -> &mut EffectBuffer {
        &mut self.out
    }

    fn set_current_event(&mut self, event: &HistoryEvent) {
        self.current_event = Some(event.clone());
    }
}

pub(crate) type ChildWorkflowMachine = Machine<State, Explicit, ChildWorkflowData>;

fn definition() -> &'static StateMachineDefinition<State, Explicit, ChildWorkflowData> {
    static DEFINITION: OnceLock<StateMachineDefinition<State, Explicit, ChildWorkflowData>> =
        OnceLock::new();
    DEFINITION.get_or_init(|| {
        StateMachineDefinition::new(
            "ChildWorkflow",
            State::Created,
            &[
                State::Completed,
                State::Failed,
                State::Canceled,
                State::TimedOut,
                State::Terminated,
                State::StartFailed,
            ],
        )
        .add_with(
            State::Created,
            Trigger::Explicit(Explicit::Schedule),
            State::StartCommandCreated,
            |data: &mut ChildWorkflowData| {
                data.out.add_command(Command::new(
                    CommandAttributes::StartChildWorkflowExecution(data.attributes.clone()),
                ));
            },
        )
        .add(
            State::StartCommandCreated,
            Trigger::Command(CommandType::StartChildWorkflowExecution),
            State::StartCommandCreated,
        )
        .add(
            State::StartCommandCreated,
            Trigger::Event(EventType::StartChildWorkflowExecutionInitiated),
            State::InitiatedEventRecorded,
        )
        .add_with(
            State::StartCommandCreated,
            Trigger::Explicit(Explicit::Cancel),
            State::Canceled,
            |data| {
                data.out.cancel_initial_command();
                data.notify(ChildWorkflowResolution::Canceled { details: None });
            },
        )
        .add_with(
            State::InitiatedEventRecorded,
            Trigger::Event(EventType::StartChildWorkflowExecutionFailed),
            State::StartFailed,
            ChildWorkflowData::notify_from_terminal_event,
        )
        .add_with(
            State::InitiatedEventRecorded,
            Trigger::Event(EventType::ChildWorkflowExecutionStarted),
            State::StartedEventRecorded,
            ChildWorkflowData::notify_started,
        )
        .add_with(
            State::StartedEventRecorded,
            Trigger::Event(EventType::ChildWorkflowExecutionCompleted),
            State::Completed,
            ChildWorkflowData::notify_from_terminal_event,
        )
        .add_with(
            State::StartedEventRecorded,
            Trigger::Event(EventType::ChildWorkflowExecutionFailed),
            State::Failed,
            ChildWorkflowData::notify_from_terminal_event,
        )
        .add_with(
            State::StartedEventRecorded,
            Trigger::Event(EventType::ChildWorkflowExecutionCanceled),
            State::Canceled,
            ChildWorkflowData::notify_from_terminal_event,
        )
        .add_with(
            State::StartedEventRecorded,
            Trigger::Event(EventType::ChildWorkflowExecutionTimedOut),
            State::TimedOut,
            ChildWorkflowData::notify_from_terminal_event,
        )
        .add_with(
            State::StartedEventRecorded,
            Trigger::Event(EventType::ChildWorkflowExecutionTerminated),
            State::Terminated,
            ChildWorkflowData::notify_from_terminal_event,
        )
    })
}

pub(crate) fn new_machine(
    attributes: StartChildWorkflowExecutionAttributes,
    started: ChildStartedCallback,
    completion: SharedChildCompletion,
    sink: Option<StateMachineSink>,
) -> CoreResult<ChildWorkflowMachine> {
    let mut machine = Machine::new(
        definition(),
        ChildWorkflowData {
            attributes,
            started: Some(started),
            completion,
            current_event: None,
            out: EffectBuffer::default(),
        },
        sink,
    );
    machine.fire(Trigger::Explicit(Explicit::Schedule))?;
    Ok(machine)
}

/// True while the start command has not shipped; the only time the child can
/// be cancelled directly rather than via a cancel-external request.
pub(crate) fn is_cancellable(machine: &ChildWorkflowMachine) -> bool {
    machine.state() == State::StartCommandCreated
}

pub(crate) fn cancel(machine: &mut ChildWorkflowMachine) -> CoreResult<()> {
    match machine.state() {
        State::StartCommandCreated => machine.fire(Trigger::Explicit(Explicit::Cancel)),
        _ => Ok(()),
    }
}
