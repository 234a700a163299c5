//! Entity state machines: one finite-state machine per durable operation.
//!
//! Every machine follows the same skeleton: it is created by a public
//! operation of the coordinator, fires an internal `Schedule` explicit event
//! that emits its initial command, transitions through states as the matching
//! command event and further events arrive, and terminates in a final state
//! after invoking its completion callback exactly once. Completion callbacks
//! are owned by the machines; the coordinator never stores them.

pub(crate) mod definition;

mod activity;
mod cancel_external;
mod cancel_workflow;
mod child_workflow;
mod complete_workflow;
mod continue_as_new;
mod fail_workflow;
mod local_activity;
mod mutable_side_effect;
mod side_effect;
mod signal_external;
mod timer;
mod upsert_search_attributes;
mod version;
mod wft_buffer;
mod workflow_task;

pub mod workflow_machines;

pub use activity::{ActivityCancellationType, ActivityResolution};
pub use child_workflow::{ChildWorkflowCancellationType, ChildWorkflowResolution};
pub use definition::{StateMachineSink, TransitionRecord};
pub use local_activity::{
    ExecuteLocalActivityParameters, LocalActivityExecutionResult, LocalActivityResolution,
};
pub use timer::TimerResolution;
pub use version::DEFAULT_VERSION;
pub use workflow_machines::{StateMachinesListener, WorkflowStateMachines};

pub(crate) use child_workflow::SharedChildCompletion;
pub(crate) use local_activity::LocalActivityMachine;
pub(crate) use mutable_side_effect::MutableSideEffectMachine;
pub(crate) use version::VersionMachine;
pub(crate) use wft_buffer::WftBuffer;
pub(crate) use workflow_task::{WorkflowTaskMachine, WorkflowTaskStartedNotification};

use crate::command::{Command, CommandType};
use crate::error::CoreResult;
use crate::failure::Failure;
use crate::history::{HistoryEvent, WorkflowExecution};
use definition::{Machine, Trigger};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Result of offering a history event to a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleEventStatus {
    Matched,
    NonMatching,
}

/// Cancellation handle returned to workflow code.
pub type CancellationHandle = Box<dyn Fn() + Send + Sync>;

pub type ActivityCallback = Box<dyn FnOnce(ActivityResolution) + Send>;
pub type TimerCallback = Box<dyn FnOnce(TimerResolution) + Send>;
pub type ChildStartedCallback = Box<dyn FnOnce(WorkflowExecution) + Send>;
pub type ChildCompletionCallback = Box<dyn FnOnce(ChildWorkflowResolution) + Send>;
pub type ExternalOperationCallback = Box<dyn FnOnce(Result<(), Failure>) + Send>;
pub type SideEffectCallback = Box<dyn FnOnce(Value) + Send>;
pub type MutableSideEffectCallback = Box<dyn FnOnce(Option<Value>) + Send>;
pub type VersionCallback = Box<dyn FnOnce(Result<i32, Failure>) + Send>;
pub type LocalActivityCallback = Box<dyn FnOnce(LocalActivityResolution) + Send>;

/// A command newly emitted by a machine, with its cancellation flag.
pub(crate) struct NewCommand {
    pub command: Command,
    pub canceled: Arc<AtomicBool>,
}

/// Side effects accumulated by a machine while it held its lock. The
/// coordinator applies them after releasing the lock: commands are wrapped
/// and enqueued, callbacks run free of any lock.
#[derive(Default)]
pub(crate) struct MachineEffects {
    pub commands: Vec<NewCommand>,
    pub callbacks: Vec<Box<dyn FnOnce() + Send>>,
    pub local_activity_requests: Vec<ExecuteLocalActivityParameters>,
}

impl MachineEffects {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
            && self.callbacks.is_empty()
            && self.local_activity_requests.is_empty()
    }
}

/// Buffer the machine actions write into.
#[derive(Default)]
pub(crate) struct EffectBuffer {
    effects: MachineEffects,
    initial_command_flag: Option<Arc<AtomicBool>>,
    last_command_flag: Option<Arc<AtomicBool>>,
}

impl EffectBuffer {
    /// Emit a command. The first emitted command is remembered so the machine
    /// can cancel it while it is still pending.
    pub fn add_command(&mut self, command: Command) {
        let canceled = Arc::new(AtomicBool::new(false));
        if self.initial_command_flag.is_none() {
            self.initial_command_flag = Some(canceled.clone());
        }
        self.last_command_flag = Some(canceled.clone());
        self.effects.commands.push(NewCommand { command, canceled });
    }

    /// Cancellation flag of the most recently emitted command.
    pub fn last_command_flag(&self) -> Option<Arc<AtomicBool>> {
        self.last_command_flag.clone()
    }

    /// Cancel the initial command before it ships, if it was emitted.
    pub fn cancel_initial_command(&mut self) {
        if let Some(flag) = &self.initial_command_flag {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn callback(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.effects.callbacks.push(Box::new(callback));
    }

    pub fn request_local_activity(&mut self, parameters: ExecuteLocalActivityParameters) {
        self.effects.local_activity_requests.push(parameters);
    }

    pub fn take(&mut self) -> MachineEffects {
        std::mem::take(&mut self.effects)
    }
}

/// Uniform dispatch surface over all machine variants.
pub(crate) trait EntityStateMachine: Send {
    fn name(&self) -> &'static str;

    /// Offer a history event. `NonMatching` means the machine has no
    /// transition (or a content mismatch) for this event in its current
    /// state; the caller decides whether that is a nondeterminism error.
    fn handle_event(&mut self, event: &HistoryEvent, has_next: bool)
        -> CoreResult<HandleEventStatus>;

    /// Notification that the command was moved to the authoritative queue.
    fn handle_command(&mut self, command_type: CommandType);

    /// Notification that a workflow task started while this machine's
    /// command is in the queue.
    fn handle_workflow_task_started(&mut self) {}

    fn is_final_state(&self) -> bool;

    fn take_effects(&mut self) -> MachineEffects;
}

pub(crate) type MachineHandle = Arc<Mutex<dyn EntityStateMachine>>;

/// Hooks the generic machine needs from its per-variant data.
pub(crate) trait MachineData {
    fn out(&mut self) -> &mut EffectBuffer;

    /// Content-level check applied before the transition table. Machines
    /// that match on marker names or ids reject foreign events here.
    fn accepts_event(&self, _event: &HistoryEvent) -> bool {
        true
    }

    /// The event is stashed so transition actions can read its payload.
    fn set_current_event(&mut self, _event: &HistoryEvent) {}
}

impl<S, E, D> EntityStateMachine for Machine<S, E, D>
where
    S: Copy + Eq + Hash + Debug + Send + Sync + 'static,
    E: Copy + Eq + Hash + Debug + Send + Sync + 'static,
    D: MachineData + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.machine_name()
    }

    fn handle_event(
        &mut self,
        event: &HistoryEvent,
        _has_next: bool,
    ) -> CoreResult<HandleEventStatus> {
        let trigger = Trigger::Event(event.event_type());
        if !self.can_fire(trigger) || !self.data.accepts_event(event) {
            return Ok(HandleEventStatus::NonMatching);
        }
        self.data.set_current_event(event);
        self.fire(trigger)?;
        Ok(HandleEventStatus::Matched)
    }

    fn handle_command(&mut self, command_type: CommandType) {
        let trigger = Trigger::Command(command_type);
        if self.can_fire(trigger) {
            // The transition table is total for expected notifications.
            let _ = self.fire(trigger);
        }
    }

    fn is_final_state(&self) -> bool {
        self.is_final()
    }

    fn take_effects(&mut self) -> MachineEffects {
        self.data.out().take()
    }
}

/// A command together with its owning machine and cancellation flag. Sits in
/// the coordinator queues; cancelled entries are skipped instead of shipped.
#[derive(Clone)]
pub(crate) struct CancellableCommand {
    pub command: Command,
    pub machine: MachineHandle,
    pub canceled: Arc<AtomicBool>,
}

impl CancellableCommand {
    pub fn new(command: Command, machine: MachineHandle, canceled: Arc<AtomicBool>) -> Self {
        Self {
            command,
            machine,
            canceled,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn command_type(&self) -> CommandType {
        self.command.command_type()
    }
}
