//! Side-effect marker machine.
//!
//! On first execution the user function runs once and its result is recorded
//! in a marker; the callback resolves when the command is prepared. During
//! replay the function is never invoked: a placeholder command keeps the
//! queue aligned and the callback resolves with the value carried by the
//! recorded marker event.

use super::definition::{Machine, StateMachineDefinition, StateMachineSink, Trigger};
use super::{EffectBuffer, MachineData, SideEffectCallback};
use crate::command::{Command, CommandAttributes, CommandType};
use crate::error::CoreResult;
use crate::history::{EventType, HistoryEvent};
use crate::markers::{self, SIDE_EFFECT_MARKER_NAME};
use serde_json::Value;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum State {
    Created,
    MarkerCommandCreated,
    ResultNotified,
    MarkerCommandRecorded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Explicit {
    Schedule,
}

pub(crate) struct SideEffectData {
    id: u64,
    replaying: bool,
    func: Option<Box<dyn FnOnce() -> Value + Send>>,
    result: Option<Value>,
    callback: Option<SideEffectCallback>,
    current_event: Option<HistoryEvent>,
    out: EffectBuffer,
}

impl SideEffectData {
    fn emit_marker(&mut self) {
        let data = if self.replaying {
            // Placeholder; the recorded marker event carries the real value.
            Value::Null
        } else {
            let func = self.func.take();
            let value = func.map(|f| f()).unwrap_or(Value::Null);
            self.result = Some(value.clone());
            value
        };
        self.out
            .add_command(Command::new(CommandAttributes::RecordMarker(
                markers::side_effect_marker(self.id, data),
            )));
    }

    fn notify_if_executing(&mut self) {
        if self.replaying {
            return;
        }
        if let (Some(callback), Some(result)) = (self.callback.take(), self.result.clone()) {
            self.out.callback(move || callback(result));
        }
    }

    fn notify_if_replaying(&mut self) {
        if !self.replaying {
            return;
        }
        let recorded = self
            .current_event
            .as_ref()
            .and_then(|e| markers::marker_attributes(e))
            .and_then(markers::marker_data)
            .unwrap_or(Value::Null);
        if let Some(callback) = self.callback.take() {
            self.out.callback(move || callback(recorded));
        }
    }
}

impl MachineData for SideEffectData {
    fn out(&mut self) -> &mut EffectBuffer {
        &mut self.out
    }

    fn accepts_event(&self, event: &HistoryEvent) -> bool {
        let Some(attributes) = markers::marker_attributes(event) else {
            return true;
        };
        if attributes.marker_name != SIDE_EFFECT_MARKER_NAME {
            return false;
        }
        attributes
            .details
            .get(markers::MARKER_ID_KEY)
            .and_then(|v| v.as_u64())
            == Some(self.id)
    }

    fn set_current_event(&mut self, event: &HistoryEvent) {
        self.current_event = Some(event.clone());
    }
}

pub(crate) type SideEffectMachine = Machine<State, Explicit, SideEffectData>;

fn definition() -> &'static StateMachineDefinition<State, Explicit, SideEffectData> {
    static DEFINITION: OnceLock<StateMachineDefinition<State, Explicit, SideEffectData>> =
        OnceLock::new();
    DEFINITION.get_or_init(|| {
        StateMachineDefinition::new(
            "SideEffect",
            State::Created,
            &[State::MarkerCommandRecorded],
        )
        .add_with(
            State::Created,
            Trigger::Explicit(Explicit::Schedule),
            State::MarkerCommandCreated,
            SideEffectData::emit_marker,
        )
        .add_with(
            State::MarkerCommandCreated,
            Trigger::Command(CommandType::RecordMarker),
            State::ResultNotified,
            SideEffectData::notify_if_executing,
        )
        .add_with(
            State::ResultNotified,
            Trigger::Event(EventType::MarkerRecorded),
            State::MarkerCommandRecorded,
            SideEffectData::notify_if_replaying,
        )
    })
}

pub(crate) fn new_machine(
    id: u64,
    replaying: bool,
    func: Box<dyn FnOnce() -> Value + Send>,
    callback: SideEffectCallback,
    sink: Option<StateMachineSink>,
) -> CoreResult<SideEffectMachine> {
    let mut machine = Machine::new(
        definition(),
        SideEffectData {
            id,
            replaying,
            func: Some(func),
            result: None,
            callback: Some(callback),
            current_event: None,
            out: EffectBuffer::default(),
        },
        sink,
    );
    machine.fire(Trigger::Explicit(Explicit::Schedule))?;
    Ok(machine)
}
