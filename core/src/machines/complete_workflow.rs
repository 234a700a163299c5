//! Completes the workflow execution. Terminal: once this command is emitted
//! no further commands may be produced in the workflow task.

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

pub(crate) struct CompleteWorkflowData {
    result: Option<Value>,
    out: EffectBuffer,
}

impl MachineData for CompleteWorkflowData {
    fn out(&mut self) -> &mut EffectBuffer {
        &mut self.out
    }
}

pub(crate) type CompleteWorkflowMachine = Machine<State, Explicit, CompleteWorkflowData>;

fn definition() -> &'static StateMachineDefinition<State, Explicit, CompleteWorkflowData> {
    static DEFINITION: OnceLock<StateMachineDefinition<State, Explicit, CompleteWorkflowData>> =
        OnceLock::new();
    DEFINITION.get_or_init(|| {
        StateMachineDefinition::new("CompleteWorkflow", State::Created, &[State::CommandRecorded])
            .add_with(
                State::Created,
                Trigger::Explicit(Explicit::Schedule),
                State::CommandCreated,
                |data: &mut CompleteWorkflowData| {
                    data.out.add_command(Command::new(
                        CommandAttributes::CompleteWorkflowExecution {
                            result: data.result.clone(),
                        },
                    ));
                },
            )
            .add(
                State::CommandCreated,
                Trigger::Command(CommandType::CompleteWorkflowExecution),
                State::CommandCreated,
            )
            .add(
                State::CommandCreated,
                Trigger::Event(EventType::WorkflowExecutionCompleted),
                State::CommandRecorded,
            )
    })
}

pub(crate) fn new_machine(
    result: Option<Value>,
    sink: Option<StateMachineSink>,
) -> CoreResult<CompleteWorkflowMachine> {
    let mut machine = Machine::new(
        definition(),
        CompleteWorkflowData {
            result,
            out: EffectBuffer::default(),
        },
        sink,
    );
    machine.fire(Trigger::Explicit(Explicit::Schedule))?;
    Ok(machine)
}
