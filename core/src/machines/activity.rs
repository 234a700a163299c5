//! Activity task machine.
//!
//! The cancellation type chosen at schedule time governs whether a
//! request-cancel command is emitted when workflow code cancels the activity,
//! and when the completion callback resolves as cancelled:
//!
//! - `Abandon` never emits a cancel command; the callback resolves
//!   immediately and later terminal events are absorbed silently.
//! - `TryCancel` emits the cancel command and resolves immediately.
//! - `WaitCancellationRequested` resolves once the cancel request is
//!   recorded.
//! - `WaitCancellationCompleted` resolves only on the activity's actual
//!   terminal event.

use super::definition::{Machine, StateMachineDefinition, StateMachineSink, Trigger};
use super::{ActivityCallback, EffectBuffer, MachineData};
use crate::command::{Command, CommandAttributes, CommandType, ScheduleActivityTaskAttributes};
use crate::error::CoreResult;
use crate::failure::Failure;
use crate::history::{EventAttributes, EventType, HistoryEvent};
use serde_json::Value;
use std::sync::OnceLock;

/// Governs the effect of cancelling an in-flight activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityCancellationType {
    Abandon,
    TryCancel,
    WaitCancellationRequested,
    #[default]
    WaitCancellationCompleted,
}

/// Outcome delivered to the activity completion callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityResolution {
    Completed { result: Option<Value> },
    Failed { failure: Failure },
    TimedOut { failure: Failure },
    Canceled { details: Option<Value> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum State {
    Created,
    ScheduleCommandCreated,
    ScheduledEventRecorded,
    Started,
    ScheduledActivityCancelCommandCreated,
    StartedActivityCancelCommandCreated,
    CancelRequestedEventRecorded,
    Completed,
    Failed,
    TimedOut,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Explicit {
    Schedule,
    ImmediateCancel,
    CancelCommand,
}

pub(crate) struct ActivityData {
    attributes: ScheduleActivityTaskAttributes,
    cancellation_type: ActivityCancellationType,
    completion: Option<ActivityCallback>,
    scheduled_event_id: i64,
    current_event: Option<HistoryEvent>,
    out: EffectBuffer,
}

impl ActivityData {
    fn notify(&mut self, resolution: ActivityResolution) {
        if let Some(callback) = self.completion.take() {
            self.out.callback(move || callback(resolution));
        }
    }

    fn notify_canceled(&mut self) {
        self.notify(ActivityResolution::Canceled { details: None });
    }

    fn notify_from_terminal_event(&mut self) {
        let resolution = match self.current_event.as_ref().map(|e| &e.attributes) {
            Some(EventAttributes::ActivityTaskCompleted { result, .. }) => {
                ActivityResolution::Completed {
                    result: result.clone(),
                }
            }
            Some(EventAttributes::ActivityTaskFailed { failure, .. }) => {
                ActivityResolution::Failed {
                    failure: failure.clone(),
                }
            }
            Some(EventAttributes::ActivityTaskTimedOut { failure, .. }) => {
                ActivityResolution::TimedOut {
                    failure: failure.clone(),
                }
            }
            Some(EventAttributes::ActivityTaskCanceled { details, .. }) => {
                ActivityResolution::Canceled {
                    details: details.clone(),
                }
            }
            _ => return,
        };
        self.notify(resolution);
    }

    fn record_scheduled_event_id(&mut self) {
        if let Some(event) = &self.current_event {
            self.scheduled_event_id = event.event_id;
        }
    }

    fn emit_cancel_command(&mut self) {
        self.out.add_command(Command::new(
            CommandAttributes::RequestCancelActivityTask {
                scheduled_event_id: self.scheduled_event_id,
            },
        ));
    }

    fn notify_if_wait_requested(&mut self) {
        if self.cancellation_type == ActivityCancellationType::WaitCancellationRequested {
            self.notify_canceled();
        }
    }
}

impl MachineData for ActivityData {
    fn out(&mut self) -> &mut EffectBuffer {
        &mut self.out
    }

    fn accepts_event(&self, event: &HistoryEvent) -> bool {
        match &event.attributes {
            EventAttributes::ActivityTaskScheduled(attributes) => {
                attributes.activity_id == self.attributes.activity_id
            }
            _ => true,
        }
    }

    fn set_current_event(&mut self, event: &HistoryEvent) {
        self.current_event = Some(event.clone());
    }
}

pub(crate) type ActivityMachine = Machine<State, Explicit, ActivityData>;

fn definition() -> &'static StateMachineDefinition<State, Explicit, ActivityData> {
    static DEFINITION: OnceLock<StateMachineDefinition<State, Explicit, ActivityData>> =
        OnceLock::new();
    DEFINITION.get_or_init(|| {
        StateMachineDefinition::new(
            "Activity",
            State::Created,
            &[
                State::Completed,
                State::Failed,
                State::TimedOut,
                State::Canceled,
            ],
        )
        .add_with(
            State::Created,
            Trigger::Explicit(Explicit::Schedule),
            State::ScheduleCommandCreated,
            |data: &mut ActivityData| {
                data.out
                    .add_command(Command::new(CommandAttributes::ScheduleActivityTask(
                        data.attributes.clone(),
                    )));
            },
        )
        .add(
            State::ScheduleCommandCreated,
            Trigger::Command(CommandType::ScheduleActivityTask),
            State::ScheduleCommandCreated,
        )
        .add_with(
            State::ScheduleCommandCreated,
            Trigger::Event(EventType::ActivityTaskScheduled),
            State::ScheduledEventRecorded,
            ActivityData::record_scheduled_event_id,
        )
        .add_with(
            State::ScheduleCommandCreated,
            Trigger::Explicit(Explicit::ImmediateCancel),
            State::Canceled,
            |data| {
                data.out.cancel_initial_command();
                data.notify_canceled();
            },
        )
        .add(
            State::ScheduledEventRecorded,
            Trigger::Event(EventType::ActivityTaskStarted),
            State::Started,
        )
        .add_with(
            State::ScheduledEventRecorded,
            Trigger::Event(EventType::ActivityTaskTimedOut),
            State::TimedOut,
            ActivityData::notify_from_terminal_event,
        )
        .add_with(
            State::ScheduledEventRecorded,
            Trigger::Explicit(Explicit::CancelCommand),
            State::ScheduledActivityCancelCommandCreated,
            ActivityData::emit_cancel_command,
        )
        .add_with(
            State::Started,
            Trigger::Event(EventType::ActivityTaskCompleted),
            State::Completed,
            ActivityData::notify_from_terminal_event,
        )
        .add_with(
            State::Started,
            Trigger::Event(EventType::ActivityTaskFailed),
            State::Failed,
            ActivityData::notify_from_terminal_event,
        )
        .add_with(
            State::Started,
            Trigger::Event(EventType::ActivityTaskTimedOut),
            State::TimedOut,
            ActivityData::notify_from_terminal_event,
        )
        .add_with(
            State::Started,
            Trigger::Explicit(Explicit::CancelCommand),
            State::StartedActivityCancelCommandCreated,
            ActivityData::emit_cancel_command,
        )
        .add(
            State::ScheduledActivityCancelCommandCreated,
            Trigger::Command(CommandType::RequestCancelActivityTask),
            State::ScheduledActivityCancelCommandCreated,
        )
        .add(
            State::StartedActivityCancelCommandCreated,
            Trigger::Command(CommandType::RequestCancelActivityTask),
            State::StartedActivityCancelCommandCreated,
        )
        .add(
            State::ScheduledActivityCancelCommandCreated,
            Trigger::Event(EventType::ActivityTaskStarted),
            State::StartedActivityCancelCommandCreated,
        )
        .add_with(
            State::ScheduledActivityCancelCommandCreated,
            Trigger::Event(EventType::ActivityTaskCancelRequested),
            State::CancelRequestedEventRecorded,
            ActivityData::notify_if_wait_requested,
        )
        .add_with(
            State::StartedActivityCancelCommandCreated,
            Trigger::Event(EventType::ActivityTaskCancelRequested),
            State::CancelRequestedEventRecorded,
            ActivityData::notify_if_wait_requested,
        )
        .add_with(
            State::CancelRequestedEventRecorded,
            Trigger::Event(EventType::ActivityTaskCanceled),
            State::Canceled,
            ActivityData::notify_from_terminal_event,
        )
        .add_with(
            State::CancelRequestedEventRecorded,
            Trigger::Event(EventType::ActivityTaskCompleted),
            State::Completed,
            ActivityData::notify_from_terminal_event,
        )
        .add_with(
            State::CancelRequestedEventRecorded,
            Trigger::Event(EventType::ActivityTaskFailed),
            State::Failed,
            ActivityData::notify_from_terminal_event,
        )
        .add_with(
            State::CancelRequestedEventRecorded,
            Trigger::Event(EventType::ActivityTaskTimedOut),
            State::TimedOut,
            ActivityData::notify_from_terminal_event,
        )
        .add(
            State::CancelRequestedEventRecorded,
            Trigger::Event(EventType::ActivityTaskStarted),
            State::CancelRequestedEventRecorded,
        )
    })
}

pub(crate) fn new_machine(
    attributes: ScheduleActivityTaskAttributes,
    cancellation_type: ActivityCancellationType,
    completion: ActivityCallback,
    sink: Option<StateMachineSink>,
) -> CoreResult<ActivityMachine> {
    let mut machine = Machine::new(
        definition(),
        ActivityData {
            attributes,
            cancellation_type,
            completion: Some(completion),
            scheduled_event_id: 0,
            current_event: None,
            out: EffectBuffer::default(),
        },
        sink,
    );
    machine.fire(Trigger::Explicit(Explicit::Schedule))?;
    Ok(machine)
}

/// Cancellation entry point; behavior depends on the machine state and the
/// cancellation type chosen at schedule time.
pub(crate) fn cancel(machine: &mut ActivityMachine) -> CoreResult<()> {
    match machine.state() {
        State::ScheduleCommandCreated => {
            machine.fire(Trigger::Explicit(Explicit::ImmediateCancel))
        }
        State::ScheduledEventRecorded | State::Started => {
            match machine.data.cancellation_type {
                ActivityCancellationType::Abandon => {
                    machine.data.notify_canceled();
                    Ok(())
                }
                ActivityCancellationType::TryCancel => {
                    machine.fire(Trigger::Explicit(Explicit::CancelCommand))?;
                    machine.data.notify_canceled();
                    Ok(())
                }
                ActivityCancellationType::WaitCancellationRequested
                | ActivityCancellationType::WaitCancellationCompleted => {
                    machine.fire(Trigger::Explicit(Explicit::CancelCommand))
                }
            }
        }
        _ => Ok(()),
    }
}
