//! Mutable-side-effect machine, keyed by a user-chosen id.
//!
//! One machine serves every invocation for its id. On execution a marker is
//! recorded only when the produced value differs from the last recorded one.
//! During replay each invocation emits a speculative marker command: if the
//! next command event is the matching marker, the recorded value resolves the
//! caller; any other event (or the next workflow-task-started notification)
//! cancels the speculative command and resolves the caller with the last
//! recorded value. The coordinator's queue skips cancelled commands, which is
//! what keeps the command/event alignment intact.

use super::{
    EffectBuffer, EntityStateMachine, HandleEventStatus, MachineEffects, MutableSideEffectCallback,
};
use crate::command::{Command, CommandAttributes, CommandType};
use crate::error::{CoreError, CoreResult};
use crate::history::HistoryEvent;
use crate::markers::{self, MUTABLE_SIDE_EFFECT_MARKER_NAME};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    CommandCreatedExecuting,
    CommandCreatedReplaying,
}

pub(crate) struct MutableSideEffectMachine {
    id: String,
    state: State,
    last_value: Option<Value>,
    pending_callback: Option<MutableSideEffectCallback>,
    pending_value: Option<Value>,
    speculative_flag: Option<Arc<AtomicBool>>,
    out: EffectBuffer,
}

impl MutableSideEffectMachine {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: State::Idle,
            last_value: None,
            pending_callback: None,
            pending_value: None,
            speculative_flag: None,
            out: EffectBuffer::default(),
        }
    }

    /// One `mutable_side_effect` call from workflow code.
    pub fn invoke(
        &mut self,
        func: Box<dyn FnOnce(Option<&Value>) -> Option<Value> + Send>,
        callback: MutableSideEffectCallback,
        replaying: bool,
    ) -> CoreResult<()> {
        if self.state != State::Idle {
            return Err(CoreError::IllegalState(format!(
                "mutable side effect '{}' invoked while a prior invocation is still pending",
                self.id
            )));
        }
        if replaying {
            self.emit_marker_command(Value::Null);
            self.pending_callback = Some(callback);
            self.state = State::CommandCreatedReplaying;
            return Ok(());
        }

        let produced = func(self.last_value.as_ref());
        match produced {
            Some(value) if self.last_value.as_ref() != Some(&value) => {
                self.emit_marker_command(value.clone());
                self.last_value = Some(value.clone());
                self.pending_callback = Some(callback);
                self.pending_value = Some(value);
                self.state = State::CommandCreatedExecuting;
            }
            _ => {
                // Unchanged: nothing recorded, resolve with the last value.
                let value = self.last_value.clone();
                self.out.callback(move || callback(value));
            }
        }
        Ok(())
    }

    fn emit_marker_command(&mut self, data: Value) {
        self.out
            .add_command(Command::new(CommandAttributes::RecordMarker(
                markers::mutable_side_effect_marker(&self.id, data),
            )));
        self.speculative_flag = self.out.last_command_flag();
    }

    fn matches(&self, event: &HistoryEvent) -> bool {
        markers::marker_attributes(event)
            .filter(|a| a.marker_name == MUTABLE_SIDE_EFFECT_MARKER_NAME)
            .and_then(|a| markers::marker_string_detail(a, markers::MARKER_ID_KEY))
            .as_deref()
            == Some(self.id.as_str())
    }

    /// Cancel the speculative command and resolve the caller with the last
    /// recorded value.
    fn skip_speculative_command(&mut self) {
        if let Some(flag) = self.speculative_flag.take() {
            flag.store(true, Ordering::SeqCst);
        }
        if let Some(callback) = self.pending_callback.take() {
            let value = self.last_value.clone();
            self.out.callback(move || callback(value));
        }
        self.pending_value = None;
        self.state = State::Idle;
    }
}

impl EntityStateMachine for MutableSideEffectMachine {
    fn name(&self) -> &'static str {
        "MutableSideEffect"
    }

    fn handle_event(
        &mut self,
        event: &HistoryEvent,
        _has_next: bool,
    ) -> CoreResult<HandleEventStatus> {
        if !self.matches(event) {
            if self.state == State::CommandCreatedReplaying {
                self.skip_speculative_command();
            }
            return Ok(HandleEventStatus::NonMatching);
        }

        let recorded = markers::marker_attributes(event)
            .and_then(markers::marker_data)
            .unwrap_or(Value::Null);
        self.last_value = Some(recorded.clone());
        if let Some(callback) = self.pending_callback.take() {
            self.out.callback(move || callback(Some(recorded)));
        }
        self.pending_value = None;
        self.speculative_flag = None;
        self.state = State::Idle;
        Ok(HandleEventStatus::Matched)
    }

    fn handle_command(&mut self, command_type: CommandType) {
        if command_type != CommandType::RecordMarker {
            return;
        }
        if self.state == State::CommandCreatedExecuting {
            if let Some(callback) = self.pending_callback.take() {
                let value = self.pending_value.take();
                self.out.callback(move || callback(value));
            }
            // The command stays queued; its marker event is matched in a
            // later batch without a second resolution.
            self.state = State::Idle;
        }
    }

    fn handle_workflow_task_started(&mut self) {
        if self.state == State::CommandCreatedReplaying {
            self.skip_speculative_command();
        }
    }

    fn is_final_state(&self) -> bool {
        self.state == State::Idle
    }

    fn take_effects(&mut self) -> MachineEffects {
        self.out.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::EventAttributes;
    use chrono::Utc;
    use parking_lot::Mutex;
    use serde_json::json;

    type Captured = Arc<Mutex<Vec<Option<Value>>>>;

    fn callback(captured: &Captured) -> MutableSideEffectCallback {
        let captured = captured.clone();
        Box::new(move |v| captured.lock().push(v))
    }

    fn run(machine: &mut MutableSideEffectMachine) -> Vec<Command> {
        let effects = machine.take_effects();
        let commands = effects
            .commands
            .iter()
            .filter(|c| !c.canceled.load(Ordering::SeqCst))
            .map(|c| c.command.clone())
            .collect();
        for callback in effects.callbacks {
            callback();
        }
        commands
    }

    fn marker_event(id: &str, value: Value) -> HistoryEvent {
        HistoryEvent::new(
            6,
            Utc::now(),
            EventAttributes::MarkerRecorded(markers::mutable_side_effect_marker(id, value)),
        )
    }

    #[test]
    fn test_execution_records_marker_only_when_value_changes() {
        let observed: Captured = Arc::new(Mutex::new(Vec::new()));
        let mut machine = MutableSideEffectMachine::new("x");

        machine
            .invoke(Box::new(|_| Some(json!(42))), callback(&observed), false)
            .unwrap();
        let commands = run(&mut machine);
        assert_eq!(commands.len(), 1);
        machine.handle_command(CommandType::RecordMarker);
        let _ = run(&mut machine);

        // Second and third invocations produce the same value: no marker.
        for _ in 0..2 {
            machine
                .invoke(
                    Box::new(|prev| prev.cloned()),
                    callback(&observed),
                    false,
                )
                .unwrap();
            assert!(run(&mut machine).is_empty());
        }

        assert_eq!(
            *observed.lock(),
            vec![Some(json!(42)), Some(json!(42)), Some(json!(42))]
        );
    }

    #[test]
    fn test_replay_resolves_from_marker_event() {
        let observed: Captured = Arc::new(Mutex::new(Vec::new()));
        let mut machine = MutableSideEffectMachine::new("x");

        machine
            .invoke(Box::new(|_| unreachable!()), callback(&observed), true)
            .unwrap();
        let _ = machine.take_effects();

        let status = machine
            .handle_event(&marker_event("x", json!(42)), true)
            .unwrap();
        assert_eq!(status, HandleEventStatus::Matched);
        let _ = run(&mut machine);
        assert_eq!(*observed.lock(), vec![Some(json!(42))]);
    }

    #[test]
    fn test_replay_non_matching_event_cancels_and_uses_last_value() {
        let observed: Captured = Arc::new(Mutex::new(Vec::new()));
        let mut machine = MutableSideEffectMachine::new("x");

        // First invocation consumed the recorded marker.
        machine
            .invoke(Box::new(|_| unreachable!()), callback(&observed), true)
            .unwrap();
        let first_effects = machine.take_effects();
        machine
            .handle_event(&marker_event("x", json!(42)), true)
            .unwrap();
        for cb in machine.take_effects().callbacks {
            cb();
        }
        drop(first_effects);

        // Second invocation: no marker for it in history.
        machine
            .invoke(Box::new(|_| unreachable!()), callback(&observed), true)
            .unwrap();
        let effects = machine.take_effects();
        let flag = effects.commands[0].canceled.clone();

        let foreign = HistoryEvent::new(
            9,
            Utc::now(),
            EventAttributes::TimerStarted(crate::command::StartTimerAttributes {
                timer_id: "1".to_string(),
                start_to_fire_timeout: std::time::Duration::from_secs(1),
            }),
        );
        let status = machine.handle_event(&foreign, true).unwrap();
        assert_eq!(status, HandleEventStatus::NonMatching);
        assert!(flag.load(Ordering::SeqCst));
        for cb in machine.take_effects().callbacks {
            cb();
        }
        assert_eq!(*observed.lock(), vec![Some(json!(42)), Some(json!(42))]);
    }

    #[test]
    fn test_workflow_task_started_resolves_trailing_replay_invocation() {
        let observed: Captured = Arc::new(Mutex::new(Vec::new()));
        let mut machine = MutableSideEffectMachine::new("x");
        machine
            .invoke(Box::new(|_| unreachable!()), callback(&observed), true)
            .unwrap();
        machine
            .handle_event(&marker_event("x", json!(7)), true)
            .unwrap();
        for cb in machine.take_effects().callbacks {
            cb();
        }

        machine
            .invoke(Box::new(|_| unreachable!()), callback(&observed), true)
            .unwrap();
        machine.handle_workflow_task_started();
        for cb in machine.take_effects().callbacks {
            cb();
        }
        assert_eq!(*observed.lock(), vec![Some(json!(7)), Some(json!(7))]);
    }

    #[test]
    fn test_overlapping_invocation_is_rejected() {
        let observed: Captured = Arc::new(Mutex::new(Vec::new()));
        let mut machine = MutableSideEffectMachine::new("x");
        machine
            .invoke(Box::new(|_| unreachable!()), callback(&observed), true)
            .unwrap();
        let error = machine
            .invoke(Box::new(|_| unreachable!()), callback(&observed), true)
            .unwrap_err();
        assert!(error.to_string().contains("still pending"));
    }
}
