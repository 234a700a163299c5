//! Signals an external (or child) workflow execution.

use super::definition::{Machine, StateMachineDefinition, StateMachineSink, Trigger};
use super::{EffectBuffer, ExternalOperationCallback, MachineData};
use crate::command::{
    Command, CommandAttributes, CommandType, SignalExternalWorkflowExecutionAttributes,
};
use crate::error::CoreResult;
use crate::failure::Failure;
use crate::history::{EventAttributes, EventType, HistoryEvent};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum State {
    Created,
    CommandCreated,
    InitiatedEventRecorded,
    Signaled,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Explicit {
    Schedule,
    Cancel,
}

pub(crate) struct SignalExternalData {
    attributes: SignalExternalWorkflowExecutionAttributes,
    completion: Option<ExternalOperationCallback>,
    current_event: Option<HistoryEvent>,
    out: EffectBuffer,
}

impl SignalExternalData {
    fn notify(&mut self, result: Result<(), Failure>) {
        if let Some(callback) = self.completion.take() {
            self.out.callback(move || callback(result));
        }
    }

    fn notify_failed(&mut self) {
        let cause = match self.current_event.as_ref().map(|e| &e.attributes) {
            Some(EventAttributes::SignalExternalWorkflowExecutionFailed { cause, .. }) => {
                cause.clone()
            }
            _ => "unknown".to_string(),
        };
        let workflow_id = self.attributes.workflow_id.clone();
        self.notify(Err(Failure::application(
            "signal-external-workflow-failed",
            format!("signal delivery to workflow '{workflow_id}' failed: {cause}"),
            true,
            None,
        )));
    }
}

impl MachineData for SignalExternalData {
    fn out(&mut self) -> &mut EffectBuffer {
        &mut self.out
    }

    fn set_current_event(&mut self, event: &HistoryEvent) {
        self.current_event = Some(event.clone());
    }
}

pub(crate) type SignalExternalMachine = Machine<State, Explicit, SignalExternalData>;

fn definition() -> &'static StateMachineDefinition<State, Explicit, SignalExternalData> {
    static DEFINITION: OnceLock<StateMachineDefinition<State, Explicit, SignalExternalData>> =
        OnceLock::new();
    DEFINITION.get_or_init(|| {
        StateMachineDefinition::new(
            "SignalExternal",
            State::Created,
            &[State::Signaled, State::Failed, State::Canceled],
        )
        .add_with(
            State::Created,
            Trigger::Explicit(Explicit::Schedule),
            State::CommandCreated,
            |data: &mut SignalExternalData| {
                data.out.add_command(Command::new(
                    CommandAttributes::SignalExternalWorkflowExecution(data.attributes.clone()),
                ));
            },
        )
        .add(
            State::CommandCreated,
            Trigger::Command(CommandType::SignalExternalWorkflowExecution),
            State::CommandCreated,
        )
        .add(
            State::CommandCreated,
            Trigger::Event(EventType::SignalExternalWorkflowExecutionInitiated),
            State::InitiatedEventRecorded,
        )
        .add_with(
            State::CommandCreated,
            Trigger::Explicit(Explicit::Cancel),
            State::Canceled,
            |data| {
                data.out.cancel_initial_command();
                data.notify(Err(Failure::canceled("external signal cancelled")));
            },
        )
        .add_with(
            State::InitiatedEventRecorded,
            Trigger::Event(EventType::ExternalWorkflowExecutionSignaled),
            State::Signaled,
            |data| data.notify(Ok(())),
        )
        .add_with(
            State::InitiatedEventRecorded,
            Trigger::Event(EventType::SignalExternalWorkflowExecutionFailed),
            State::Failed,
            SignalExternalData::notify_failed,
        )
    })
}

pub(crate) fn new_machine(
    attributes: SignalExternalWorkflowExecutionAttributes,
    completion: ExternalOperationCallback,
    sink: Option<StateMachineSink>,
) -> CoreResult<SignalExternalMachine> {
    let mut machine = Machine::new(
        definition(),
        SignalExternalData {
            attributes,
            completion: Some(completion),
            current_event: None,
            out: EffectBuffer::default(),
        },
        sink,
    );
    machine.fire(Trigger::Explicit(Explicit::Schedule))?;
    Ok(machine)
}

/// Cancel before the command ships; a no-op once the signal was initiated.
pub(crate) fn cancel(machine: &mut SignalExternalMachine) -> CoreResult<()> {
    match machine.state() {
        State::CommandCreated => machine.fire(Trigger::Explicit(Explicit::Cancel)),
        _ => Ok(()),
    }
}
