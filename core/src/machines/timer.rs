//! Durable timer machine.
//!
//! Cancellation while the start command is still pending cancels the command
//! and resolves the completion callback synchronously; after the timer
//! started remotely, a cancel-timer command is emitted and the callback is
//! resolved without waiting for the cancellation to be recorded.

use super::definition::{Machine, StateMachineDefinition, StateMachineSink, Trigger};
use super::{EffectBuffer, MachineData, TimerCallback};
use crate::command::{Command, CommandAttributes, CommandType, StartTimerAttributes};
use crate::error::CoreResult;
use crate::history::{EventAttributes, EventType, HistoryEvent};
use std::sync::OnceLock;

/// Outcome delivered to the timer completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerResolution {
    Fired,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum State {
    Created,
    StartCommandCreated,
    Started,
    CancelCommandCreated,
    Fired,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Explicit {
    Schedule,
    Cancel,
}

pub(crate) struct TimerData {
    attributes: StartTimerAttributes,
    completion: Option<TimerCallback>,
    out: EffectBuffer,
}

impl TimerData {
    fn notify(&mut self, resolution: TimerResolution) {
        if let Some(callback) = self.completion.take() {
            self.out.callback(move || callback(resolution));
        }
    }
}

impl MachineData for TimerData {
    fn out(&mut self) -> &mut EffectBuffer {
        &mut self.out
    }

    fn accepts_event(&self, event: &HistoryEvent) -> bool {
        match &event.attributes {
            EventAttributes::TimerStarted(attributes) => {
                attributes.timer_id == self.attributes.timer_id
            }
            EventAttributes::TimerFired { timer_id, .. }
            | EventAttributes::TimerCanceled { timer_id, .. } => {
                *timer_id == self.attributes.timer_id
            }
            _ => true,
        }
    }
}

pub(crate) type TimerMachine = Machine<State, Explicit, TimerData>;

fn definition() -> &'static StateMachineDefinition<State, Explicit, TimerData> {
    static DEFINITION: OnceLock<StateMachineDefinition<State, Explicit, TimerData>> =
        OnceLock::new();
    DEFINITION.get_or_init(|| {
        StateMachineDefinition::new("Timer", State::Created, &[State::Fired, State::Canceled])
            .add_with(
                State::Created,
                Trigger::Explicit(Explicit::Schedule),
                State::StartCommandCreated,
                |data: &mut TimerData| {
                    data.out
                        .add_command(Command::new(CommandAttributes::StartTimer(
                            data.attributes.clone(),
                        )));
                },
            )
            .add(
                State::StartCommandCreated,
                Trigger::Command(CommandType::StartTimer),
                State::StartCommandCreated,
            )
            .add(
                State::StartCommandCreated,
                Trigger::Event(EventType::TimerStarted),
                State::Started,
            )
            .add_with(
                State::StartCommandCreated,
                Trigger::Explicit(Explicit::Cancel),
                State::Canceled,
                |data| {
                    data.out.cancel_initial_command();
                    data.notify(TimerResolution::Canceled);
                },
            )
            .add_with(
                State::Started,
                Trigger::Event(EventType::TimerFired),
                State::Fired,
                |data| data.notify(TimerResolution::Fired),
            )
            .add_with(
                State::Started,
                Trigger::Explicit(Explicit::Cancel),
                State::CancelCommandCreated,
                |data| {
                    data.out
                        .add_command(Command::new(CommandAttributes::CancelTimer {
                            timer_id: data.attributes.timer_id.clone(),
                        }));
                    data.notify(TimerResolution::Canceled);
                },
            )
            .add(
                State::CancelCommandCreated,
                Trigger::Command(CommandType::CancelTimer),
                State::CancelCommandCreated,
            )
            .add(
                State::CancelCommandCreated,
                Trigger::Event(EventType::TimerCanceled),
                State::Canceled,
            )
            // Fired raced the cancel request; the callback already resolved
            // as cancelled.
            .add(
                State::CancelCommandCreated,
                Trigger::Event(EventType::TimerFired),
                State::Fired,
            )
    })
}

pub(crate) fn new_machine(
    attributes: StartTimerAttributes,
    completion: TimerCallback,
    sink: Option<StateMachineSink>,
) -> CoreResult<TimerMachine> {
    let mut machine = Machine::new(
        definition(),
        TimerData {
            attributes,
            completion: Some(completion),
            out: EffectBuffer::default(),
        },
        sink,
    );
    machine.fire(Trigger::Explicit(Explicit::Schedule))?;
    Ok(machine)
}

/// Initiate cancellation; a no-op once the timer reached a terminal state.
pub(crate) fn cancel(machine: &mut TimerMachine) -> CoreResult<()> {
    match machine.state() {
        State::StartCommandCreated | State::Started => {
            machine.fire(Trigger::Explicit(Explicit::Cancel))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::super::EntityStateMachine;
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn attributes() -> StartTimerAttributes {
        StartTimerAttributes {
            timer_id: "1".to_string(),
            start_to_fire_timeout: Duration::from_secs(5),
        }
    }

    fn machine_with_resolution() -> (TimerMachine, Arc<Mutex<Option<TimerResolution>>>) {
        let resolution = Arc::new(Mutex::new(None));
        let captured = resolution.clone();
        let machine = new_machine(
            attributes(),
            Box::new(move |r| *captured.lock() = Some(r)),
            None,
        )
        .unwrap();
        (machine, resolution)
    }

    #[test]
    fn test_schedule_emits_start_timer_command() {
        let (mut machine, _) = machine_with_resolution();
        let effects = machine.take_effects();
        assert_eq!(effects.commands.len(), 1);
        assert_eq!(
            effects.commands[0].command.command_type(),
            CommandType::StartTimer
        );
    }

    #[test]
    fn test_fired_event_resolves_callback() {
        let (mut machine, resolution) = machine_with_resolution();
        let _ = machine.take_effects();

        let started = HistoryEvent::new(
            5,
            Utc::now(),
            EventAttributes::TimerStarted(attributes()),
        );
        machine.handle_event(&started, true).unwrap();

        let fired = HistoryEvent::new(
            8,
            Utc::now(),
            EventAttributes::TimerFired {
                timer_id: "1".to_string(),
                started_event_id: 5,
            },
        );
        machine.handle_event(&fired, false).unwrap();
        for callback in machine.take_effects().callbacks {
            callback();
        }
        assert_eq!(*resolution.lock(), Some(TimerResolution::Fired));
        assert!(machine.is_final_state());
    }

    #[test]
    fn test_immediate_cancel_cancels_pending_command() {
        let (mut machine, resolution) = machine_with_resolution();
        let effects = machine.take_effects();
        let flag = effects.commands[0].canceled.clone();

        cancel(&mut machine).unwrap();
        for callback in machine.take_effects().callbacks {
            callback();
        }
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(*resolution.lock(), Some(TimerResolution::Canceled));
        assert!(machine.is_final_state());
    }

    #[test]
    fn test_cancel_after_started_emits_cancel_command() {
        let (mut machine, resolution) = machine_with_resolution();
        let _ = machine.take_effects();

        let started = HistoryEvent::new(
            5,
            Utc::now(),
            EventAttributes::TimerStarted(attributes()),
        );
        machine.handle_event(&started, true).unwrap();

        cancel(&mut machine).unwrap();
        let effects = machine.take_effects();
        assert_eq!(
            effects.commands[0].command.command_type(),
            CommandType::CancelTimer
        );
        for callback in effects.callbacks {
            callback();
        }
        assert_eq!(*resolution.lock(), Some(TimerResolution::Canceled));
    }

    #[test]
    fn test_foreign_timer_event_is_non_matching() {
        let (mut machine, _) = machine_with_resolution();
        let _ = machine.take_effects();
        let foreign = HistoryEvent::new(
            5,
            Utc::now(),
            EventAttributes::TimerStarted(StartTimerAttributes {
                timer_id: "other".to_string(),
                start_to_fire_timeout: Duration::from_secs(1),
            }),
        );
        let status = machine.handle_event(&foreign, true).unwrap();
        assert_eq!(status, super::super::HandleEventStatus::NonMatching);
    }

    #[test]
    fn test_cancel_twice_resolves_once() {
        let (mut machine, resolution) = machine_with_resolution();
        let _ = machine.take_effects();
        cancel(&mut machine).unwrap();
        cancel(&mut machine).unwrap();
        let callbacks = machine.take_effects().callbacks;
        assert_eq!(callbacks.len(), 1);
        for callback in callbacks {
            callback();
        }
        assert_eq!(*resolution.lock(), Some(TimerResolution::Canceled));
    }
}
