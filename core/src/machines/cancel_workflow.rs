//! Reports the workflow execution as cancelled after its code unwound in
//! response to a cancel request.

use super::definition::{Machine, StateMachineDefinition, StateMachineSink, Trigger};
use super::{EffectBuffer, MachineData};
use crate::command::{Command, CommandAttributes, CommandType};
use crate::error::CoreResult;
use crate::history::EventType;
use serde_json::Value;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum State {
    Created,
    CommandCreated,
    CommandRecorded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Explicit {
    Schedule,
}

pub(crate) struct CancelWorkflowData {
    details: Option<Value>,
    out: EffectBuffer,
}

impl MachineData for CancelWorkflowData {
    fn out(&mut self) -> &mut EffectBuffer {
        &mut self.out
    }
}

pub(crate) type CancelWorkflowMachine = Machine<State, Explicit, CancelWorkflowData>;

fn definition() -> &'static StateMachineDefinition<State, Explicit, CancelWorkflowData> {
    static DEFINITION: OnceLock<StateMachineDefinition<State, Explicit, CancelWorkflowData>> =
        OnceLock::new();
    DEFINITION.get_or_init(|| {
        StateMachineDefinition::new("CancelWorkflow", State::Created, &[State::CommandRecorded])
            .add_with(
                State::Created,
                Trigger::Explicit(Explicit::Schedule),
                State::CommandCreated,
                |data: &mut CancelWorkflowData| {
                    data.out
                        .add_command(Command::new(CommandAttributes::CancelWorkflowExecution {
                            details: data.details.clone(),
                        }));
                },
            )
            .add(
                State::CommandCreated,
                Trigger::Command(CommandType::CancelWorkflowExecution),
                State::CommandCreated,
            )
            .add(
                State::CommandCreated,
                Trigger::Event(EventType::WorkflowExecutionCanceled),
                State::CommandRecorded,
            )
    })
}

pub(crate) fn new_machine(
    details: Option<Value>,
    sink: Option<StateMachineSink>,
) -> CoreResult<CancelWorkflowMachine> {
    let mut machine = Machine::new(
        definition(),
        CancelWorkflowData {
            details,
            out: EffectBuffer::default(),
        },
        sink,
    );
    machine.fire(Trigger::Explicit(Explicit::Schedule))?;
    Ok(machine)
}
