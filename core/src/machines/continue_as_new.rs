//! Atomically closes this run and starts a new one with fresh history.

use super::definition::{Machine, StateMachineDefinition, StateMachineSink, Trigger};
use super::{EffectBuffer, MachineData};
use crate::command::{
    Command, CommandAttributes, CommandType, ContinueAsNewWorkflowExecutionAttributes,
};
use crate::error::CoreResult;
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

pub(crate) struct ContinueAsNewData {
    attributes: ContinueAsNewWorkflowExecutionAttributes,
    out: EffectBuffer,
}

impl MachineData for ContinueAsNewData {
    fn out(&mut self) -> &mut EffectBuffer {
        &mut self.out
    }
}

pub(crate) type ContinueAsNewMachine = Machine<State, Explicit, ContinueAsNewData>;

fn definition() -> &'static StateMachineDefinition<State, Explicit, ContinueAsNewData> {
    static DEFINITION: OnceLock<StateMachineDefinition<State, Explicit, ContinueAsNewData>> =
        OnceLock::new();
    DEFINITION.get_or_init(|| {
        StateMachineDefinition::new("ContinueAsNew", State::Created, &[State::CommandRecorded])
            .add_with(
                State::Created,
                Trigger::Explicit(Explicit::Schedule),
                State::CommandCreated,
                |data: &mut ContinueAsNewData| {
                    data.out.add_command(Command::new(
                        CommandAttributes::ContinueAsNewWorkflowExecution(data.attributes.clone()),
                    ));
                },
            )
            .add(
                State::CommandCreated,
                Trigger::Command(CommandType::ContinueAsNewWorkflowExecution),
                State::CommandCreated,
            )
            .add(
                State::CommandCreated,
                Trigger::Event(EventType::WorkflowExecutionContinuedAsNew),
                State::CommandRecorded,
            )
    })
}

pub(crate) fn new_machine(
    attributes: ContinueAsNewWorkflowExecutionAttributes,
    sink: Option<StateMachineSink>,
) -> CoreResult<ContinueAsNewMachine> {
    let mut machine = Machine::new(
        definition(),
        ContinueAsNewData {
            attributes,
            out: EffectBuffer::default(),
        },
        sink,
    );
    machine.fire(Trigger::Explicit(Explicit::Schedule))?;
    Ok(machine)
}
