//! Fails the workflow execution with a structured failure. Mutually
//! exclusive with the complete-workflow terminal.

use super::definition::{Machine, StateMachineDefinition, StateMachineSink, Trigger};
use super::{EffectBuffer, MachineData};
use crate::command::{Command, CommandAttributes, CommandType};
use crate::error::CoreResult;
use crate::failure::Failure;
use crate::history::EventType;
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

pub(crate) struct FailWorkflowData {
    failure: Failure,
    out: EffectBuffer,
}

impl MachineData for FailWorkflowData {
    fn out(&mut self) -> &mut EffectBuffer {
        &mut self.out
    }
}

pub(crate) type FailWorkflowMachine = Machine<State, Explicit, FailWorkflowData>;

fn definition() -> &'static StateMachineDefinition<State, Explicit, FailWorkflowData> {
    static DEFINITION: OnceLock<StateMachineDefinition<State, Explicit, FailWorkflowData>> =
        OnceLock::new();
    DEFINITION.get_or_init(|| {
        StateMachineDefinition::new("FailWorkflow", State::Created, &[State::CommandRecorded])
            .add_with(
                State::Created,
                Trigger::Explicit(Explicit::Schedule),
                State::CommandCreated,
                |data: &mut FailWorkflowData| {
                    data.out
                        .add_command(Command::new(CommandAttributes::FailWorkflowExecution {
                            failure: data.failure.clone(),
                        }));
                },
            )
            .add(
                State::CommandCreated,
                Trigger::Command(CommandType::FailWorkflowExecution),
                State::CommandCreated,
            )
            .add(
                State::CommandCreated,
                Trigger::Event(EventType::WorkflowExecutionFailed),
                State::CommandRecorded,
            )
    })
}

pub(crate) fn new_machine(
    failure: Failure,
    sink: Option<StateMachineSink>,
) -> CoreResult<FailWorkflowMachine> {
    let mut machine = Machine::new(
        definition(),
        FailWorkflowData {
            failure,
            out: EffectBuffer::default(),
        },
        sink,
    );
    machine.fire(Trigger::Explicit(Explicit::Schedule))?;
    Ok(machine)
}
