//! Upserts workflow search attributes. Fire-and-forget: no completion
//! callback, the command event alone finalizes the machine.

use super::definition::{Machine, StateMachineDefinition, StateMachineSink, Trigger};
use super::{EffectBuffer, MachineData};
use crate::command::{
    Command, CommandAttributes, CommandType, UpsertWorkflowSearchAttributesAttributes,
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

pub(crate) struct UpsertSearchAttributesData {
    attributes: UpsertWorkflowSearchAttributesAttributes,
    out: EffectBuffer,
}

impl MachineData for UpsertSearchAttributesData {
    fn out(&mut self) -> &mut EffectBuffer {
        &mut self.out
    }
}

pub(crate) type UpsertSearchAttributesMachine = Machine<State, Explicit, UpsertSearchAttributesData>;

fn definition() -> &'static StateMachineDefinition<State, Explicit, UpsertSearchAttributesData> {
    static DEFINITION: OnceLock<
        StateMachineDefinition<State, Explicit, UpsertSearchAttributesData>,
    > = OnceLock::new();
    DEFINITION.get_or_init(|| {
        StateMachineDefinition::new(
            "UpsertSearchAttributes",
            State::Created,
            &[State::CommandRecorded],
        )
        .add_with(
            State::Created,
            Trigger::Explicit(Explicit::Schedule),
            State::CommandCreated,
            |data: &mut UpsertSearchAttributesData| {
                data.out.add_command(Command::new(
                    CommandAttributes::UpsertWorkflowSearchAttributes(data.attributes.clone()),
                ));
            },
        )
        .add(
            State::CommandCreated,
            Trigger::Command(CommandType::UpsertWorkflowSearchAttributes),
            State::CommandCreated,
        )
        .add(
            State::CommandCreated,
            Trigger::Event(EventType::UpsertWorkflowSearchAttributes),
            State::CommandRecorded,
        )
    })
}

pub(crate) fn new_machine(
    attributes: UpsertWorkflowSearchAttributesAttributes,
    sink: Option<StateMachineSink>,
) -> CoreResult<UpsertSearchAttributesMachine> {
    let mut machine = Machine::new(
        definition(),
        UpsertSearchAttributesData {
            attributes,
            out: EffectBuffer::default(),
        },
        sink,
    );
    machine.fire(Trigger::Explicit(Explicit::Schedule))?;
    Ok(machine)
}

#[cfg(test)]
mod tests {
    use super::super::EntityStateMachine;
    use super::*;
    use crate::history::{EventAttributes, HistoryEvent};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_upsert_lifecycle() {
        let attributes = UpsertWorkflowSearchAttributesAttributes {
            search_attributes: BTreeMap::from([("customer".to_string(), json!("acme"))]),
        };
        let mut machine = new_machine(attributes.clone(), None).unwrap();
        let effects = machine.take_effects();
        assert_eq!(
            effects.commands[0].command.command_type(),
            CommandType::UpsertWorkflowSearchAttributes
        );

        let event = HistoryEvent::new(
            6,
            Utc::now(),
            EventAttributes::UpsertWorkflowSearchAttributes(attributes),
        );
        machine.handle_event(&event, true).unwrap();
        assert!(machine.is_final_state());
    }
}
