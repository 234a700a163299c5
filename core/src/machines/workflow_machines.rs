//! The workflow state machines coordinator.
//!
//! Consumes history in workflow-task-sized batches, matches each replayed
//! command event against the head of the command queue, routes other events
//! to the entity machine registered under their initiating event id, and
//! exposes the public operations workflow code is allowed to call while the
//! event loop is running.
//!
//! The coordinator is shared behind an `Arc` but is used by a single thread
//! at a time; the internal mutex is held only for short state edits and is
//! always released before calling out into machine callbacks or workflow
//! code, which makes re-entrant operations (a side-effect callback that
//! schedules more commands) safe.

use super::definition::StateMachineSink;
use super::{
    activity, cancel_external, cancel_workflow, child_workflow, complete_workflow,
    continue_as_new, fail_workflow, side_effect, signal_external, timer,
    upsert_search_attributes, ActivityCallback, ActivityCancellationType, ActivityResolution,
    CancellableCommand, CancellationHandle, ChildCompletionCallback, ChildStartedCallback,
    ChildWorkflowCancellationType, ChildWorkflowResolution, EntityStateMachine,
    ExecuteLocalActivityParameters, ExternalOperationCallback, HandleEventStatus,
    LocalActivityCallback, LocalActivityExecutionResult, LocalActivityMachine, MachineEffects,
    MachineHandle, MutableSideEffectCallback, MutableSideEffectMachine, SharedChildCompletion,
    SideEffectCallback, TimerCallback, TimerResolution, VersionCallback, VersionMachine,
    WftBuffer, WorkflowTaskMachine, WorkflowTaskStartedNotification,
};
use crate::command::{
    Command, CommandAttributes, ContinueAsNewWorkflowExecutionAttributes,
    RequestCancelExternalWorkflowExecutionAttributes, ScheduleActivityTaskAttributes,
    SignalExternalWorkflowExecutionAttributes, StartChildWorkflowExecutionAttributes,
    StartTimerAttributes, UpsertWorkflowSearchAttributesAttributes,
};
use crate::error::{CoreError, CoreResult, ReplayStateSnapshot};
use crate::failure::Failure;
use crate::history::{EventAttributes, EventType, HistoryEvent};
use crate::machines::local_activity::LocalActivityState;
use crate::markers::{self, LocalActivityMarkerData};
use crate::random::{self, DeterministicRng};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Callbacks from the coordinator into the workflow runtime.
pub trait StateMachinesListener: Send + Sync {
    /// The workflow execution started; instantiate the workflow code.
    fn start(&self, event: &HistoryEvent);
    /// A signal was delivered.
    fn signal(&self, event: &HistoryEvent);
    /// The execution was asked to cancel.
    fn cancel(&self, event: &HistoryEvent);
    /// The execution timed out on the service side. Terminal.
    fn workflow_timed_out(&self, event: &HistoryEvent);
    /// Run workflow code until it blocks again.
    fn event_loop(&self);
}

struct Inner {
    previous_started_event_id: i64,
    workflow_task_started_event_id: i64,
    current_started_event_id: i64,
    last_handled_event_id: i64,
    current_run_id: Option<String>,
    id_counter: u64,
    side_effect_counter: u64,
    current_time_millis: i64,
    replaying: bool,
    event_loop_executing: bool,
    preparing: bool,
    terminal_command_emitted: bool,
    workflow_closed: bool,
    state_machines: HashMap<i64, MachineHandle>,
    commands: VecDeque<CancellableCommand>,
    cancellable_commands: VecDeque<CancellableCommand>,
    mutable_side_effects: HashMap<String, Arc<Mutex<MutableSideEffectMachine>>>,
    versions: HashMap<String, Arc<Mutex<VersionMachine>>>,
    local_activities: HashMap<String, Arc<Mutex<LocalActivityMachine>>>,
    local_activity_requests: Vec<ExecuteLocalActivityParameters>,
    wft_buffer: WftBuffer,
}

impl Inner {
    fn new() -> Self {
        Self {
            previous_started_event_id: 0,
            workflow_task_started_event_id: 0,
            current_started_event_id: 0,
            last_handled_event_id: 0,
            current_run_id: None,
            id_counter: 0,
            side_effect_counter: 0,
            current_time_millis: 0,
            replaying: false,
            event_loop_executing: false,
            preparing: false,
            terminal_command_emitted: false,
            workflow_closed: false,
            state_machines: HashMap::new(),
            commands: VecDeque::new(),
            cancellable_commands: VecDeque::new(),
            mutable_side_effects: HashMap::new(),
            versions: HashMap::new(),
            local_activities: HashMap::new(),
            local_activity_requests: Vec::new(),
            wft_buffer: WftBuffer::new(),
        }
    }
}

pub struct WorkflowStateMachines {
    listener: Arc<dyn StateMachinesListener>,
    sink: Option<StateMachineSink>,
    weak_self: Weak<WorkflowStateMachines>,
    inner: Mutex<Inner>,
}

impl WorkflowStateMachines {
    pub fn new(listener: Arc<dyn StateMachinesListener>) -> Arc<Self> {
        Self::build(listener, None)
    }

    pub fn with_sink(listener: Arc<dyn StateMachinesListener>, sink: StateMachineSink) -> Arc<Self> {
        Self::build(listener, Some(sink))
    }

    fn build(listener: Arc<dyn StateMachinesListener>, sink: Option<StateMachineSink>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            listener,
            sink,
            weak_self: weak_self.clone(),
            inner: Mutex::new(Inner::new()),
        })
    }

    /// Set the workflow-task boundaries delivered by the transport.
    ///
    /// `previous_started_event_id` is the started event id of the last
    /// workflow task the service knows to have completed;
    /// `workflow_task_started_event_id` is the started event of the task
    /// being processed now.
    pub fn set_started_ids(
        &self,
        previous_started_event_id: i64,
        workflow_task_started_event_id: i64,
    ) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if previous_started_event_id < inner.current_started_event_id {
            return Err(CoreError::ProgressRegression {
                previous_started_event_id,
                current_started_event_id: inner.current_started_event_id,
            });
        }
        inner.previous_started_event_id = previous_started_event_id;
        inner.workflow_task_started_event_id = workflow_task_started_event_id;
        inner.replaying = previous_started_event_id > inner.current_started_event_id;
        Ok(())
    }

    /// Handle a single event from the workflow history. Events at or below
    /// the last handled id are dropped; batches are dispatched once a full
    /// workflow-task boundary is buffered.
    pub fn handle_event(&self, event: &HistoryEvent, has_next: bool) -> CoreResult<()> {
        let batch = {
            let mut inner = self.inner.lock();
            if inner.workflow_closed {
                return Err(CoreError::IllegalState(format!(
                    "event {} received after the workflow execution closed",
                    event.event_id
                )));
            }
            if event.event_id <= inner.last_handled_event_id {
                return Ok(());
            }
            inner.last_handled_event_id = event.event_id;
            if inner.wft_buffer.add_event(event, has_next) {
                Some(inner.wft_buffer.fetch())
            } else {
                None
            }
        };
        if let Some(batch) = batch {
            self.handle_events_batch(&batch, has_next)?;
        }
        Ok(())
    }

    /// All events of a single workflow-task attempt. Version markers are
    /// preloaded over the whole batch before any event in it is dispatched.
    fn handle_events_batch(
        &self,
        events: &[HistoryEvent],
        has_next: bool,
    ) -> CoreResult<()> {
        for event in events {
            self.preload_version_marker(event)
                .map_err(|error| self.event_processing_error(error, event))?;
        }
        let mut iterator = events.iter().peekable();
        while let Some(event) = iterator.next() {
            let more = iterator.peek().is_some() || has_next;
            self.handle_single_event(event, more)
                .map_err(|error| self.event_processing_error(error, event))?;
        }
        Ok(())
    }

    fn event_processing_error(&self, error: CoreError, event: &HistoryEvent) -> CoreError {
        let phase = if self.is_replaying() {
            "during replay"
        } else {
            "during execution"
        };
        let context = format!(
            "failure handling event {} of type '{:?}' {phase}",
            event.event_id,
            event.event_type()
        );
        let state = self.replay_state();
        match error {
            CoreError::NonDeterministic(message) => {
                CoreError::NonDeterministic(format!("{context}. {message}. {state}"))
            }
            other => CoreError::WorkflowTask {
                message: format!("{context}. {state}"),
                source: Some(Box::new(other)),
            },
        }
    }

    fn handle_single_event(&self, event: &HistoryEvent, has_next: bool) -> CoreResult<()> {
        if event.is_command_event() {
            self.handle_command_event(event)?;
            return Ok(());
        }

        let initial_id = event.initial_command_event_id();
        let machine = { self.inner.lock().state_machines.get(&initial_id).cloned() };
        match machine {
            Some(machine) => {
                let (status, effects, is_final) = {
                    let mut locked = machine.lock();
                    let status = locked.handle_event(event, has_next)?;
                    (status, locked.take_effects(), locked.is_final_state())
                };
                if status == HandleEventStatus::NonMatching {
                    return Err(CoreError::NonDeterministic(format!(
                        "event {} of type '{:?}' does not match the state of its entity machine",
                        event.event_id,
                        event.event_type()
                    )));
                }
                if is_final {
                    self.inner.lock().state_machines.remove(&initial_id);
                }
                self.apply_effects(&machine, effects);
            }
            None => self.handle_non_stateful_event(event, has_next)?,
        }

        // Command events never reach this point, and the completed event is
        // excluded explicitly: the flag must stay on until the whole
        // started/completed/command-events sequence of the last replayed
        // workflow task has been processed.
        {
            let mut inner = self.inner.lock();
            if inner.replaying
                && inner.current_started_event_id >= inner.previous_started_event_id
                && event.event_type() != EventType::WorkflowTaskCompleted
            {
                inner.replaying = false;
            }
        }
        Ok(())
    }

    /// Match a command event against the head of the command queue. Cancelled
    /// commands are skipped; a version marker whose `get_version` call was
    /// removed is absorbed without consuming a command; anything else that
    /// fails to line up is a nondeterminism error.
    fn handle_command_event(&self, event: &HistoryEvent) -> CoreResult<()> {
        if self.handle_local_activity_marker(event)? {
            return Ok(());
        }

        let matched = loop {
            let head = { self.inner.lock().commands.front().cloned() };
            let Some(command) = head else {
                if self.handle_non_matching_version_marker(event)? {
                    return Ok(());
                }
                return Err(CoreError::NonDeterministic(format!(
                    "no command scheduled that corresponds to event {} of type '{:?}'",
                    event.event_id,
                    event.event_type()
                )));
            };

            if command.is_canceled() {
                self.inner.lock().commands.pop_front();
                continue;
            }

            // The machine may cancel its own command here (mutable side
            // effect replay, version skip); re-check the flag afterwards.
            let (status, effects) = {
                let mut machine = command.machine.lock();
                let status = machine.handle_event(event, true)?;
                (status, machine.take_effects())
            };
            self.apply_effects(&command.machine, effects);

            if command.is_canceled() {
                self.inner.lock().commands.pop_front();
                continue;
            }

            match status {
                HandleEventStatus::Matched => {
                    self.inner.lock().commands.pop_front();
                    break command;
                }
                HandleEventStatus::NonMatching => {
                    if self.handle_non_matching_version_marker(event)? {
                        return Ok(());
                    }
                    return Err(CoreError::NonDeterministic(format!(
                        "event {} of type '{:?}' does not match command type {:?}",
                        event.event_id,
                        event.event_type(),
                        command.command_type()
                    )));
                }
            }
        };

        self.validate_command(&matched.command, event)?;
        let is_final = matched.machine.lock().is_final_state();
        if !is_final {
            self.inner
                .lock()
                .state_machines
                .insert(event.event_id, matched.machine.clone());
        }
        // Marker processing is the only command handling that can run
        // workflow code and generate new machines.
        if event.event_type() == EventType::MarkerRecorded {
            self.prepare_commands();
        }
        Ok(())
    }

    /// Local activities match by activity id instead of next-command
    /// position. Returns false when the normal command matching should
    /// continue (an outstanding marker command exists for this id).
    fn handle_local_activity_marker(&self, event: &HistoryEvent) -> CoreResult<bool> {
        let Some(attributes) = markers::marker_attributes(event) else {
            return Ok(false);
        };
        if attributes.marker_name != markers::LOCAL_ACTIVITY_MARKER_NAME {
            return Ok(false);
        }
        let Some(marker) = LocalActivityMarkerData::from_marker(attributes) else {
            return Ok(false);
        };

        let machine = {
            self.inner
                .lock()
                .local_activities
                .remove(&marker.activity_id)
        };
        let Some(machine) = machine else {
            return Err(CoreError::NonDeterministic(format!(
                "local activity of type '{}' is recorded in the history with id '{}' \
                 but was not expected by the execution",
                marker.activity_type, marker.activity_id
            )));
        };

        if machine.lock().state() == LocalActivityState::ResultNotified {
            return Ok(false);
        }

        self.set_current_time_millis(marker.replay_time_millis);
        let (status, effects) = {
            let mut locked = machine.lock();
            let status = locked.handle_event(event, true)?;
            (status, locked.take_effects())
        };
        if status == HandleEventStatus::NonMatching {
            return Err(CoreError::NonDeterministic(format!(
                "local activity marker with id '{}' does not match the machine state",
                marker.activity_id
            )));
        }
        let handle: MachineHandle = machine.clone();
        self.apply_effects(&handle, effects);
        self.event_loop();
        Ok(true)
    }

    fn preload_version_marker(&self, event: &HistoryEvent) -> CoreResult<()> {
        if !self.inner.lock().replaying || !markers::has_version_marker_structure(event) {
            return Ok(());
        }
        let Some(change_id) = markers::version_marker_change_id(event) else {
            // Will fail to match anything later; the error surfaces there.
            return Ok(());
        };
        let machine = {
            let mut inner = self.inner.lock();
            inner
                .versions
                .entry(change_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(VersionMachine::new(change_id))))
                .clone()
        };
        machine.lock().handle_markers_preload(event);
        Ok(())
    }

    fn handle_non_matching_version_marker(&self, event: &HistoryEvent) -> CoreResult<bool> {
        let Some(change_id) = markers::version_marker_change_id(event) else {
            return Ok(false);
        };
        let machine = { self.inner.lock().versions.get(&change_id).cloned() };
        let Some(machine) = machine else {
            return Err(CoreError::IllegalState(format!(
                "version machine for change '{change_id}' is expected to be initialized \
                 by execution or preloading"
            )));
        };
        machine.lock().handle_non_matching_event(event);
        Ok(true)
    }

    fn handle_non_stateful_event(
        &self,
        event: &HistoryEvent,
        has_next: bool,
    ) -> CoreResult<()> {
        match &event.attributes {
            EventAttributes::WorkflowExecutionStarted {
                original_execution_run_id,
                ..
            } => {
                self.inner.lock().current_run_id = Some(original_execution_run_id.clone());
                self.listener.start(event);
                Ok(())
            }
            EventAttributes::WorkflowTaskScheduled => {
                let weak = self.weak_self.clone();
                let machine = Arc::new(Mutex::new(WorkflowTaskMachine::new(Arc::new(
                    move |notification| {
                        if let Some(machines) = weak.upgrade() {
                            machines.workflow_task_started(notification);
                        }
                    },
                ))));
                let handle: MachineHandle = machine.clone();
                let effects = {
                    let mut locked = handle.lock();
                    locked.handle_event(event, has_next)?;
                    locked.take_effects()
                };
                self.inner
                    .lock()
                    .state_machines
                    .insert(event.event_id, handle.clone());
                self.apply_effects(&handle, effects);
                Ok(())
            }
            EventAttributes::WorkflowExecutionSignaled { .. } => {
                self.listener.signal(event);
                Ok(())
            }
            EventAttributes::WorkflowExecutionCancelRequested { .. } => {
                self.listener.cancel(event);
                Ok(())
            }
            EventAttributes::WorkflowExecutionTimedOut => {
                self.inner.lock().workflow_closed = true;
                self.listener.workflow_timed_out(event);
                Ok(())
            }
            _ => Err(CoreError::IllegalState(format!(
                "unexpected event {} of type '{:?}'",
                event.event_id,
                event.event_type()
            ))),
        }
    }

    /// The started notification of a workflow-task machine: advance workflow
    /// time, give queued marker machines their chance to resolve, release
    /// lost local-activity requests, record the started event id and run the
    /// event loop.
    fn workflow_task_started(&self, notification: WorkflowTaskStartedNotification) {
        self.set_current_time_millis(notification.current_time_millis);

        let queued: Vec<CancellableCommand> =
            { self.inner.lock().commands.iter().cloned().collect() };
        for command in queued {
            let effects = {
                let mut machine = command.machine.lock();
                machine.handle_workflow_task_started();
                machine.take_effects()
            };
            self.apply_effects(&command.machine, effects);
        }

        if notification.non_processed_workflow_task {
            let locals: Vec<Arc<Mutex<LocalActivityMachine>>> =
                { self.inner.lock().local_activities.values().cloned().collect() };
            for machine in locals {
                let effects = {
                    let mut locked = machine.lock();
                    locked.non_replay_workflow_task_started();
                    locked.take_effects()
                };
                let handle: MachineHandle = machine.clone();
                self.apply_effects(&handle, effects);
            }
        }

        self.inner.lock().current_started_event_id = notification.started_event_id;
        self.event_loop();
    }

    fn event_loop(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.event_loop_executing {
                return;
            }
            inner.event_loop_executing = true;
        }
        self.listener.event_loop();
        self.inner.lock().event_loop_executing = false;
        self.prepare_commands();
    }

    /// Drain newly created commands onto the authoritative queue. The
    /// `handle_command` notification may run workflow code (side-effect
    /// callbacks, local-activity completions) which schedules more commands,
    /// hence the queue and the re-entry guard.
    fn prepare_commands(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.preparing {
                return;
            }
            inner.preparing = true;
        }
        loop {
            let command = { self.inner.lock().cancellable_commands.pop_front() };
            let Some(command) = command else {
                break;
            };
            // Notified even when cancelled, to support mutable side effects.
            let effects = {
                let mut machine = command.machine.lock();
                machine.handle_command(command.command_type());
                machine.take_effects()
            };
            self.apply_effects(&command.machine, effects);
            self.inner.lock().commands.push_back(command);
        }
        self.inner.lock().preparing = false;
    }

    /// Enqueue commands and run callbacks a machine produced while locked.
    /// Runs with no lock held, so callbacks may re-enter the coordinator.
    fn apply_effects(&self, machine: &MachineHandle, effects: MachineEffects) {
        if effects.is_empty() {
            return;
        }
        {
            let mut inner = self.inner.lock();
            for new_command in effects.commands {
                inner.cancellable_commands.push_back(CancellableCommand::new(
                    new_command.command,
                    machine.clone(),
                    new_command.canceled,
                ));
            }
            inner
                .local_activity_requests
                .extend(effects.local_activity_requests);
        }
        for callback in effects.callbacks {
            callback();
        }
    }

    /// Cross-check a matched command/event pair.
    fn validate_command(&self, command: &Command, event: &HistoryEvent) -> CoreResult<()> {
        let expected = command.expected_event_type();
        let actual = event.event_type();
        if expected != actual {
            return Err(self.command_mismatch(command, event, "eventType", &expected, &actual));
        }
        match (&command.attributes, &event.attributes) {
            (
                CommandAttributes::ScheduleActivityTask(c),
                EventAttributes::ActivityTaskScheduled(e),
            ) => {
                if c.activity_id != e.activity_id {
                    return Err(self.command_mismatch(
                        command,
                        event,
                        "activityId",
                        &c.activity_id,
                        &e.activity_id,
                    ));
                }
                if c.activity_type != e.activity_type {
                    return Err(self.command_mismatch(
                        command,
                        event,
                        "activityType",
                        &c.activity_type,
                        &e.activity_type,
                    ));
                }
            }
            (
                CommandAttributes::StartChildWorkflowExecution(c),
                EventAttributes::StartChildWorkflowExecutionInitiated(e),
            ) => {
                if c.workflow_id != e.workflow_id {
                    return Err(self.command_mismatch(
                        command,
                        event,
                        "workflowId",
                        &c.workflow_id,
                        &e.workflow_id,
                    ));
                }
                if c.workflow_type != e.workflow_type {
                    return Err(self.command_mismatch(
                        command,
                        event,
                        "workflowType",
                        &c.workflow_type,
                        &e.workflow_type,
                    ));
                }
            }
            (CommandAttributes::StartTimer(c), EventAttributes::TimerStarted(e)) => {
                if c.timer_id != e.timer_id {
                    return Err(self.command_mismatch(
                        command,
                        event,
                        "timerId",
                        &c.timer_id,
                        &e.timer_id,
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn command_mismatch(
        &self,
        command: &Command,
        event: &HistoryEvent,
        check: &str,
        expected: &dyn std::fmt::Debug,
        actual: &dyn std::fmt::Debug,
    ) -> CoreError {
        CoreError::NonDeterministic(format!(
            "command {:?} doesn't match event {:?} with eventId={} on check {check} \
             with an expected value {expected:?} and an actual value {actual:?}",
            command.command_type(),
            event.event_type(),
            event.event_id
        ))
    }

    // =========================================================================
    // Public operations for workflow code
    // =========================================================================

    fn check_workflow_operation(&self) -> CoreResult<()> {
        let inner = self.inner.lock();
        if !inner.event_loop_executing {
            return Err(CoreError::IllegalState(
                "operation allowed only while the event loop is running".to_string(),
            ));
        }
        if inner.terminal_command_emitted {
            return Err(CoreError::IllegalState(
                "no commands may follow a workflow-closing command in the same workflow task"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Schedule an activity; the returned handle initiates cancellation
    /// according to the cancellation type.
    pub fn schedule_activity_task(
        &self,
        attributes: ScheduleActivityTaskAttributes,
        cancellation_type: ActivityCancellationType,
        callback: ActivityCallback,
    ) -> CoreResult<CancellationHandle> {
        self.check_workflow_operation()?;
        let weak = self.weak_self.clone();
        let wrapped: ActivityCallback = Box::new(move |resolution| {
            let canceled = matches!(resolution, ActivityResolution::Canceled { .. });
            callback(resolution);
            // A cancellation resolved during workflow code execution must
            // give the code a chance to make progress.
            if canceled {
                if let Some(machines) = weak.upgrade() {
                    machines.event_loop();
                }
            }
        });
        let machine = Arc::new(Mutex::new(activity::new_machine(
            attributes,
            cancellation_type,
            wrapped,
            self.sink.clone(),
        )?));
        let handle: MachineHandle = machine.clone();
        let effects = { handle.lock().take_effects() };
        self.apply_effects(&handle, effects);

        let weak = self.weak_self.clone();
        Ok(Box::new(move || {
            let Some(machines) = weak.upgrade() else {
                return;
            };
            let effects = {
                let mut locked = machine.lock();
                if activity::cancel(&mut locked).is_err() {
                    return;
                }
                locked.take_effects()
            };
            let handle: MachineHandle = machine.clone();
            machines.apply_effects(&handle, effects);
        }))
    }

    /// Create a timer; the returned handle cancels it.
    pub fn new_timer(
        &self,
        attributes: StartTimerAttributes,
        callback: TimerCallback,
    ) -> CoreResult<CancellationHandle> {
        self.check_workflow_operation()?;
        let weak = self.weak_self.clone();
        let wrapped: TimerCallback = Box::new(move |resolution| {
            let canceled = resolution == TimerResolution::Canceled;
            callback(resolution);
            // Needed due to immediate cancellation.
            if canceled {
                if let Some(machines) = weak.upgrade() {
                    machines.event_loop();
                }
            }
        });
        let machine = Arc::new(Mutex::new(timer::new_machine(
            attributes,
            wrapped,
            self.sink.clone(),
        )?));
        let handle: MachineHandle = machine.clone();
        let effects = { handle.lock().take_effects() };
        self.apply_effects(&handle, effects);

        let weak = self.weak_self.clone();
        Ok(Box::new(move || {
            let Some(machines) = weak.upgrade() else {
                return;
            };
            let effects = {
                let mut locked = machine.lock();
                if timer::cancel(&mut locked).is_err() {
                    return;
                }
                locked.take_effects()
            };
            let handle: MachineHandle = machine.clone();
            machines.apply_effects(&handle, effects);
        }))
    }

    /// Start a child workflow. The cancellation handle implements the
    /// cancellation-type semantics: before the start command ships the
    /// command itself is cancelled; afterwards a cancel-external request
    /// with `child_workflow_only` is produced, and the completion resolves
    /// according to the cancellation type.
    pub fn start_child_workflow(
        &self,
        attributes: StartChildWorkflowExecutionAttributes,
        cancellation_type: ChildWorkflowCancellationType,
        started: ChildStartedCallback,
        completion: ChildCompletionCallback,
    ) -> CoreResult<CancellationHandle> {
        self.check_workflow_operation()?;
        let shared: SharedChildCompletion = Arc::new(Mutex::new(Some(completion)));
        let machine = Arc::new(Mutex::new(child_workflow::new_machine(
            attributes.clone(),
            started,
            shared.clone(),
            self.sink.clone(),
        )?));
        let handle: MachineHandle = machine.clone();
        let effects = { handle.lock().take_effects() };
        self.apply_effects(&handle, effects);

        let weak = self.weak_self.clone();
        Ok(Box::new(move || {
            let Some(machines) = weak.upgrade() else {
                return;
            };
            if cancellation_type == ChildWorkflowCancellationType::Abandon {
                machines.notify_child_canceled(&shared);
                return;
            }
            // The only time the child can be cancelled directly is before
            // its start command went out to the service.
            {
                let mut locked = machine.lock();
                if child_workflow::is_cancellable(&locked) {
                    if child_workflow::cancel(&mut locked).is_err() {
                        return;
                    }
                    let effects = locked.take_effects();
                    drop(locked);
                    let handle: MachineHandle = machine.clone();
                    machines.apply_effects(&handle, effects);
                    machines.event_loop();
                    return;
                }
                if locked.is_final() {
                    return;
                }
            }
            let request = RequestCancelExternalWorkflowExecutionAttributes {
                workflow_id: attributes.workflow_id.clone(),
                child_workflow_only: true,
            };
            let shared_for_request = shared.clone();
            let weak_for_request = machines.weak_self.clone();
            let _ = machines.request_cancel_external_workflow_execution(
                request,
                Box::new(move |_result| {
                    if cancellation_type == ChildWorkflowCancellationType::WaitCancellationRequested
                    {
                        if let Some(machines) = weak_for_request.upgrade() {
                            machines.notify_child_canceled(&shared_for_request);
                        }
                    }
                }),
            );
            if cancellation_type == ChildWorkflowCancellationType::TryCancel {
                machines.notify_child_canceled(&shared);
            }
        }))
    }

    fn notify_child_canceled(&self, shared: &SharedChildCompletion) {
        if let Some(callback) = shared.lock().take() {
            callback(ChildWorkflowResolution::Canceled { details: None });
        }
        self.event_loop();
    }

    /// Signal an external workflow execution; the handle cancels the signal
    /// while its command has not shipped.
    pub fn signal_external_workflow_execution(
        &self,
        attributes: SignalExternalWorkflowExecutionAttributes,
        callback: ExternalOperationCallback,
    ) -> CoreResult<CancellationHandle> {
        self.check_workflow_operation()?;
        let machine = Arc::new(Mutex::new(signal_external::new_machine(
            attributes,
            callback,
            self.sink.clone(),
        )?));
        let handle: MachineHandle = machine.clone();
        let effects = { handle.lock().take_effects() };
        self.apply_effects(&handle, effects);

        let weak = self.weak_self.clone();
        Ok(Box::new(move || {
            let Some(machines) = weak.upgrade() else {
                return;
            };
            let effects = {
                let mut locked = machine.lock();
                if signal_external::cancel(&mut locked).is_err() {
                    return;
                }
                locked.take_effects()
            };
            let handle: MachineHandle = machine.clone();
            machines.apply_effects(&handle, effects);
            machines.event_loop();
        }))
    }

    pub fn request_cancel_external_workflow_execution(
        &self,
        attributes: RequestCancelExternalWorkflowExecutionAttributes,
        callback: ExternalOperationCallback,
    ) -> CoreResult<()> {
        self.check_workflow_operation()?;
        let machine = Arc::new(Mutex::new(cancel_external::new_machine(
            attributes,
            callback,
            self.sink.clone(),
        )?));
        let handle: MachineHandle = machine.clone();
        let effects = { handle.lock().take_effects() };
        self.apply_effects(&handle, effects);
        Ok(())
    }

    pub fn upsert_search_attributes(
        &self,
        attributes: UpsertWorkflowSearchAttributesAttributes,
    ) -> CoreResult<()> {
        self.check_workflow_operation()?;
        let machine = Arc::new(Mutex::new(upsert_search_attributes::new_machine(
            attributes,
            self.sink.clone(),
        )?));
        let handle: MachineHandle = machine.clone();
        let effects = { handle.lock().take_effects() };
        self.apply_effects(&handle, effects);
        Ok(())
    }

    pub fn complete_workflow(&self, result: Option<Value>) -> CoreResult<()> {
        self.check_workflow_operation()?;
        let machine = Arc::new(Mutex::new(complete_workflow::new_machine(
            result,
            self.sink.clone(),
        )?));
        self.emit_terminal(machine)
    }

    pub fn fail_workflow(&self, failure: Failure) -> CoreResult<()> {
        self.check_workflow_operation()?;
        let machine = Arc::new(Mutex::new(fail_workflow::new_machine(
            failure,
            self.sink.clone(),
        )?));
        self.emit_terminal(machine)
    }

    pub fn cancel_workflow(&self, details: Option<Value>) -> CoreResult<()> {
        self.check_workflow_operation()?;
        let machine = Arc::new(Mutex::new(cancel_workflow::new_machine(
            details,
            self.sink.clone(),
        )?));
        self.emit_terminal(machine)
    }

    pub fn continue_as_new_workflow(
        &self,
        attributes: ContinueAsNewWorkflowExecutionAttributes,
    ) -> CoreResult<()> {
        self.check_workflow_operation()?;
        let machine = Arc::new(Mutex::new(continue_as_new::new_machine(
            attributes,
            self.sink.clone(),
        )?));
        self.emit_terminal(machine)
    }

    fn emit_terminal<M: EntityStateMachine + 'static>(
        &self,
        machine: Arc<Mutex<M>>,
    ) -> CoreResult<()> {
        let handle: MachineHandle = machine;
        let effects = { handle.lock().take_effects() };
        self.apply_effects(&handle, effects);
        self.inner.lock().terminal_command_emitted = true;
        Ok(())
    }

    /// Run `func` once on first execution and record its result in a marker;
    /// replay resolves from the recorded marker without invoking `func`.
    pub fn side_effect(
        &self,
        func: Box<dyn FnOnce() -> Value + Send>,
        callback: SideEffectCallback,
    ) -> CoreResult<()> {
        self.check_workflow_operation()?;
        let weak = self.weak_self.clone();
        let wrapped: SideEffectCallback = Box::new(move |value| {
            callback(value);
            // The callback unblocked the side-effect call; let the workflow
            // code make progress.
            if let Some(machines) = weak.upgrade() {
                machines.event_loop();
            }
        });
        let (id, replaying) = {
            let mut inner = self.inner.lock();
            inner.side_effect_counter += 1;
            (inner.side_effect_counter, inner.replaying)
        };
        let machine = Arc::new(Mutex::new(side_effect::new_machine(
            id,
            replaying,
            func,
            wrapped,
            self.sink.clone(),
        )?));
        let handle: MachineHandle = machine.clone();
        let effects = { handle.lock().take_effects() };
        self.apply_effects(&handle, effects);
        Ok(())
    }

    /// Keyed side effect: `func` receives the last recorded value; a marker
    /// is recorded only when the produced value differs.
    pub fn mutable_side_effect(
        &self,
        id: &str,
        func: Box<dyn FnOnce(Option<&Value>) -> Option<Value> + Send>,
        callback: MutableSideEffectCallback,
    ) -> CoreResult<()> {
        self.check_workflow_operation()?;
        let weak = self.weak_self.clone();
        let wrapped: MutableSideEffectCallback = Box::new(move |value| {
            callback(value);
            if let Some(machines) = weak.upgrade() {
                machines.event_loop();
            }
        });
        let (machine, replaying) = {
            let mut inner = self.inner.lock();
            let replaying = inner.replaying;
            let machine = inner
                .mutable_side_effects
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(MutableSideEffectMachine::new(id))))
                .clone();
            (machine, replaying)
        };
        let effects = {
            let mut locked = machine.lock();
            locked.invoke(func, wrapped, replaying)?;
            locked.take_effects()
        };
        let handle: MachineHandle = machine.clone();
        self.apply_effects(&handle, effects);
        Ok(())
    }

    /// Versioned branch point keyed by `change_id`.
    pub fn get_version(
        &self,
        change_id: &str,
        min_supported: i32,
        max_supported: i32,
        callback: VersionCallback,
    ) -> CoreResult<()> {
        let weak = self.weak_self.clone();
        let wrapped: VersionCallback = Box::new(move |result| {
            callback(result);
            // Without this, the call would end the workflow task; instead
            // prepare subsequent commands and unblock execution once more.
            if let Some(machines) = weak.upgrade() {
                machines.event_loop();
            }
        });
        let (machine, replaying) = {
            let mut inner = self.inner.lock();
            let replaying = inner.replaying;
            let machine = inner
                .versions
                .entry(change_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(VersionMachine::new(change_id))))
                .clone();
            (machine, replaying)
        };
        let effects = {
            let mut locked = machine.lock();
            locked.get_version(min_supported, max_supported, replaying, wrapped);
            locked.take_effects()
        };
        let handle: MachineHandle = machine.clone();
        self.apply_effects(&handle, effects);
        Ok(())
    }

    /// Schedule a local activity. The request is dispatched through
    /// `take_local_activity_requests` rather than as a command; the marker
    /// command appears only upon completion.
    pub fn schedule_local_activity_task(
        &self,
        parameters: ExecuteLocalActivityParameters,
        callback: LocalActivityCallback,
    ) -> CoreResult<CancellationHandle> {
        self.check_workflow_operation()?;
        if parameters.activity_id.is_empty() {
            return Err(CoreError::IllegalState(
                "missing local activity id".to_string(),
            ));
        }
        {
            let inner = self.inner.lock();
            if inner.local_activities.contains_key(&parameters.activity_id) {
                return Err(CoreError::IllegalState(format!(
                    "duplicated local activity id: {}",
                    parameters.activity_id
                )));
            }
        }
        let weak = self.weak_self.clone();
        let wrapped: LocalActivityCallback = Box::new(move |resolution| {
            callback(resolution);
            if let Some(machines) = weak.upgrade() {
                machines.event_loop();
            }
        });
        let replaying = self.inner.lock().replaying;
        let machine = Arc::new(Mutex::new(LocalActivityMachine::new(
            parameters.clone(),
            wrapped,
            replaying,
        )));
        self.inner
            .lock()
            .local_activities
            .insert(parameters.activity_id.clone(), machine.clone());
        let handle: MachineHandle = machine.clone();
        let effects = { handle.lock().take_effects() };
        self.apply_effects(&handle, effects);

        let weak = self.weak_self.clone();
        Ok(Box::new(move || {
            let Some(machines) = weak.upgrade() else {
                return;
            };
            let effects = {
                let mut locked = machine.lock();
                locked.cancel();
                locked.take_effects()
            };
            let handle: MachineHandle = machine.clone();
            machines.apply_effects(&handle, effects);
        }))
    }

    /// Drain pending local-activity dispatch requests, marking them sent.
    pub fn take_local_activity_requests(&self) -> Vec<ExecuteLocalActivityParameters> {
        let (requests, machines) = {
            let mut inner = self.inner.lock();
            let requests = std::mem::take(&mut inner.local_activity_requests);
            let machines: Vec<Arc<Mutex<LocalActivityMachine>>> = requests
                .iter()
                .filter_map(|r| inner.local_activities.get(&r.activity_id).cloned())
                .collect();
            (requests, machines)
        };
        for machine in machines {
            machine.lock().mark_as_sent();
        }
        requests
    }

    /// Completion of a dispatched local activity, reported by the worker.
    pub fn handle_local_activity_completion(
        &self,
        result: LocalActivityExecutionResult,
    ) -> CoreResult<()> {
        let machine = {
            self.inner
                .lock()
                .local_activities
                .get(&result.activity_id)
                .cloned()
        };
        let Some(machine) = machine else {
            return Err(CoreError::IllegalState(format!(
                "unknown local activity: {}",
                result.activity_id
            )));
        };
        let now = self.current_time_millis();
        let effects = {
            let mut locked = machine.lock();
            locked.handle_completion(result, now);
            locked.take_effects()
        };
        let handle: MachineHandle = machine.clone();
        self.apply_effects(&handle, effects);
        self.prepare_commands();
        Ok(())
    }

    /// Snapshot of the commands awaiting shipment; cancelled entries are
    /// excluded. The queue itself is only consumed by event matching.
    pub fn take_commands(&self) -> Vec<Command> {
        self.inner
            .lock()
            .commands
            .iter()
            .filter(|c| !c.is_canceled())
            .map(|c| c.command.clone())
            .collect()
    }

    /// Deterministic name-based UUID over `run_id:counter`.
    pub fn random_uuid(&self) -> CoreResult<Uuid> {
        let mut inner = self.inner.lock();
        if !inner.event_loop_executing {
            return Err(CoreError::IllegalState(
                "operation allowed only while the event loop is running".to_string(),
            ));
        }
        let Some(run_id) = inner.current_run_id.clone() else {
            return Err(CoreError::IllegalState(
                "current run id is not set".to_string(),
            ));
        };
        let counter = inner.id_counter;
        inner.id_counter += 1;
        Ok(random::deterministic_uuid(&run_id, counter))
    }

    /// Deterministic generator seeded from [`Self::random_uuid`].
    pub fn new_random(&self) -> CoreResult<DeterministicRng> {
        Ok(random::deterministic_rng(self.random_uuid()?))
    }

    /// Workflow time: the latest workflow-task-started timestamp observed.
    /// Never wall-clock, never decreasing.
    pub fn current_time_millis(&self) -> i64 {
        self.inner.lock().current_time_millis
    }

    fn set_current_time_millis(&self, millis: i64) {
        let mut inner = self.inner.lock();
        if inner.current_time_millis < millis {
            inner.current_time_millis = millis;
        }
    }

    pub fn is_replaying(&self) -> bool {
        self.inner.lock().replaying
    }

    /// True once a workflow-closing command was emitted in this task.
    pub fn has_terminal_command(&self) -> bool {
        self.inner.lock().terminal_command_emitted
    }

    pub fn last_started_event_id(&self) -> i64 {
        self.inner.lock().current_started_event_id
    }

    pub fn replay_state(&self) -> ReplayStateSnapshot {
        let inner = self.inner.lock();
        ReplayStateSnapshot {
            previous_started_event_id: inner.previous_started_event_id,
            workflow_task_started_event_id: inner.workflow_task_started_event_id,
            current_started_event_id: inner.current_started_event_id,
        }
    }
}
