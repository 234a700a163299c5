//! Workflow context: the API surface workflow code programs against.
//!
//! Every operation either returns a promise backed by an entity state
//! machine, or a value derived deterministically from replay state. All of
//! them are only legal while the event loop is running; violations surface
//! as pre-failed promises or failure results rather than panics.

use crate::cancellation::CancellationScope;
use crate::error::failure_from_core;
use crate::promise::{CancelOnce, Promise};
use crate::replay_aware::{MetricsScope, ReplayAwareScope};
use kairos_core::command::{
    ContinueAsNewWorkflowExecutionAttributes, RequestCancelExternalWorkflowExecutionAttributes,
    ScheduleActivityTaskAttributes, SignalExternalWorkflowExecutionAttributes,
    StartChildWorkflowExecutionAttributes, StartTimerAttributes,
    UpsertWorkflowSearchAttributesAttributes,
};
use kairos_core::{
    ActivityCancellationType, ActivityResolution, ChildWorkflowCancellationType,
    ChildWorkflowResolution, DeterministicRng, ExecuteLocalActivityParameters, Failure,
    FailureInfo, LocalActivityResolution, RetryOptions, TimerResolution, WorkflowExecution,
    WorkflowStateMachines,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use uuid::Uuid;

/// Identity of the running workflow execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowInfo {
    pub workflow_id: String,
    pub workflow_type: String,
    pub run_id: String,
}

/// Options for scheduling an activity.
#[derive(Debug, Clone, Default)]
pub struct ActivityOptions {
    /// Explicit activity id; generated from the deterministic id sequence
    /// when absent.
    pub activity_id: Option<String>,
    pub schedule_to_close_timeout: Option<Duration>,
    pub schedule_to_start_timeout: Option<Duration>,
    pub start_to_close_timeout: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
    pub retry_options: Option<RetryOptions>,
    pub cancellation_type: ActivityCancellationType,
}

/// Options for scheduling a local activity.
#[derive(Debug, Clone, Default)]
pub struct LocalActivityOptions {
    pub activity_id: Option<String>,
    pub retry_options: Option<RetryOptions>,
    pub schedule_to_close_timeout: Option<Duration>,
    pub start_to_close_timeout: Option<Duration>,
}

/// Options for starting a child workflow.
#[derive(Debug, Clone, Default)]
pub struct ChildWorkflowOptions {
    pub workflow_id: Option<String>,
    pub execution_timeout: Option<Duration>,
    pub cancellation_type: ChildWorkflowCancellationType,
}

/// Handle to a started child workflow: one promise for the remote start, one
/// for the result.
pub struct ChildWorkflowHandle {
    pub started: Promise<WorkflowExecution>,
    pub result: Promise<Option<Value>>,
}

impl ChildWorkflowHandle {
    /// Cancel per the cancellation type chosen at start.
    pub fn cancel(&self) {
        self.result.cancel();
    }
}

struct SignalChannel {
    queued: VecDeque<Option<Value>>,
    waiters: VecDeque<crate::promise::PromiseCompleter<Option<Value>>>,
}

struct ContextInner {
    // Weak by design: the coordinator owns the listener owns this context.
    machines: Weak<WorkflowStateMachines>,
    info: WorkflowInfo,
    id_sequence: AtomicU64,
    signals: Mutex<HashMap<String, SignalChannel>>,
    root_scope: CancellationScope,
    current_scope: Mutex<CancellationScope>,
    cancel_requested: AtomicBool,
    metrics: Arc<dyn MetricsScope>,
}

/// Cloneable handle to the workflow execution context.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<ContextInner>,
}

impl WorkflowContext {
    pub(crate) fn new(
        machines: Arc<WorkflowStateMachines>,
        info: WorkflowInfo,
        metrics: Arc<dyn MetricsScope>,
    ) -> Self {
        let root_scope = CancellationScope::new();
        Self {
            inner: Arc::new(ContextInner {
                machines: Arc::downgrade(&machines),
                info,
                id_sequence: AtomicU64::new(0),
                signals: Mutex::new(HashMap::new()),
                current_scope: Mutex::new(root_scope.clone()),
                root_scope,
                cancel_requested: AtomicBool::new(false),
                metrics,
            }),
        }
    }

    pub fn info(&self) -> &WorkflowInfo {
        &self.inner.info
    }

    fn next_id(&self) -> String {
        let id = self.inner.id_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        id.to_string()
    }

    fn machines(&self) -> Result<Arc<WorkflowStateMachines>, Failure> {
        self.inner.machines.upgrade().ok_or_else(|| {
            Failure::application(
                "workflow-engine",
                "workflow execution is no longer active",
                true,
                None,
            )
        })
    }

    fn register_cancel(&self, cancel: &Arc<CancelOnce>) {
        self.inner.current_scope.lock().register(cancel.clone());
    }

    // =========================================================================
    // Durable operations
    // =========================================================================

    /// Schedule an activity; resolves with its result or with an activity
    /// failure wrapping the cause.
    pub fn schedule_activity(
        &self,
        activity_type: &str,
        input: Option<Value>,
        options: ActivityOptions,
    ) -> Promise<Option<Value>> {
        let machines = match self.machines() {
            Ok(machines) => machines,
            Err(failure) => return Promise::ready(Err(failure)),
        };
        let activity_id = options.activity_id.unwrap_or_else(|| self.next_id());
        let attributes = ScheduleActivityTaskAttributes {
            activity_id: activity_id.clone(),
            activity_type: activity_type.to_string(),
            input,
            schedule_to_close_timeout: options.schedule_to_close_timeout,
            schedule_to_start_timeout: options.schedule_to_start_timeout,
            start_to_close_timeout: options.start_to_close_timeout,
            heartbeat_timeout: options.heartbeat_timeout,
            retry_options: options.retry_options,
        };
        let (promise, completer) = Promise::pending();
        let activity_type = activity_type.to_string();
        let scheduled = machines.schedule_activity_task(
            attributes,
            options.cancellation_type,
            Box::new(move |resolution| {
                completer.complete_with(activity_outcome(&activity_type, &activity_id, resolution));
            }),
        );
        match scheduled {
            Ok(handle) => {
                let cancel = CancelOnce::new(handle);
                self.register_cancel(&cancel);
                promise.with_cancel(cancel)
            }
            Err(error) => Promise::ready(Err(failure_from_core(error))),
        }
    }

    /// Schedule a local activity: dispatched to the local worker, its result
    /// persisted through a marker rather than a round-trip to the service.
    pub fn schedule_local_activity(
        &self,
        activity_type: &str,
        input: Option<Value>,
        options: LocalActivityOptions,
    ) -> Promise<Option<Value>> {
        let machines = match self.machines() {
            Ok(machines) => machines,
            Err(failure) => return Promise::ready(Err(failure)),
        };
        let activity_id = options.activity_id.unwrap_or_else(|| self.next_id());
        let parameters = ExecuteLocalActivityParameters {
            activity_id: activity_id.clone(),
            activity_type: activity_type.to_string(),
            input,
            retry_options: options.retry_options,
            schedule_to_close_timeout: options.schedule_to_close_timeout,
            start_to_close_timeout: options.start_to_close_timeout,
        };
        let (promise, completer) = Promise::pending();
        let activity_type = activity_type.to_string();
        let scheduled = machines.schedule_local_activity_task(
            parameters,
            Box::new(move |resolution| {
                completer.complete_with(match resolution {
                    LocalActivityResolution::Completed { result } => Ok(result),
                    LocalActivityResolution::Failed { failure } => Err(Failure {
                        message: format!("local activity '{activity_type}' failed"),
                        cause: Some(Box::new(failure)),
                        info: FailureInfo::Activity {
                            activity_id: activity_id.clone(),
                            activity_type: activity_type.clone(),
                            scheduled_event_id: 0,
                        },
                    }),
                });
            }),
        );
        match scheduled {
            Ok(handle) => {
                let cancel = CancelOnce::new(handle);
                self.register_cancel(&cancel);
                promise.with_cancel(cancel)
            }
            Err(error) => Promise::ready(Err(failure_from_core(error))),
        }
    }

    /// Durable timer; resolves `Ok(())` when fired, cancelled failure when
    /// cancelled.
    pub fn timer(&self, duration: Duration) -> Promise<()> {
        let machines = match self.machines() {
            Ok(machines) => machines,
            Err(failure) => return Promise::ready(Err(failure)),
        };
        let timer_id = self.next_id();
        let attributes = StartTimerAttributes {
            timer_id: timer_id.clone(),
            start_to_fire_timeout: duration,
        };
        let (promise, completer) = Promise::pending();
        let created = machines.new_timer(
            attributes,
            Box::new(move |resolution| {
                completer.complete_with(match resolution {
                    TimerResolution::Fired => Ok(()),
                    TimerResolution::Canceled => {
                        Err(Failure::canceled(format!("timer '{timer_id}' cancelled")))
                    }
                });
            }),
        );
        match created {
            Ok(handle) => {
                let cancel = CancelOnce::new(handle);
                self.register_cancel(&cancel);
                promise.with_cancel(cancel)
            }
            Err(error) => Promise::ready(Err(failure_from_core(error))),
        }
    }

    /// Start a child workflow execution.
    pub fn start_child_workflow(
        &self,
        workflow_type: &str,
        input: Option<Value>,
        options: ChildWorkflowOptions,
    ) -> ChildWorkflowHandle {
        let machines = match self.machines() {
            Ok(machines) => machines,
            Err(failure) => {
                return ChildWorkflowHandle {
                    started: Promise::ready(Err(failure.clone())),
                    result: Promise::ready(Err(failure)),
                }
            }
        };
        let workflow_id = options
            .workflow_id
            .unwrap_or_else(|| format!("{}-child-{}", self.inner.info.workflow_id, self.next_id()));
        let attributes = StartChildWorkflowExecutionAttributes {
            workflow_id: workflow_id.clone(),
            workflow_type: workflow_type.to_string(),
            input,
            execution_timeout: options.execution_timeout,
        };
        let (started, started_completer) = Promise::pending();
        let (result, result_completer) = Promise::pending();
        let workflow_type = workflow_type.to_string();
        let started_for_completion = started_completer.clone();
        let created = machines.start_child_workflow(
            attributes,
            options.cancellation_type,
            Box::new(move |execution| started_completer.complete(execution)),
            Box::new(move |resolution| {
                let outcome = child_outcome(&workflow_type, &workflow_id, resolution);
                if let Err(failure) = &outcome {
                    // A child that never started leaves the started promise
                    // unresolved; fail it alongside the result.
                    started_for_completion.fail(failure.clone());
                }
                result_completer.complete_with(outcome);
            }),
        );
        match created {
            Ok(handle) => {
                let cancel = CancelOnce::new(handle);
                self.register_cancel(&cancel);
                ChildWorkflowHandle {
                    started,
                    result: result.with_cancel(cancel),
                }
            }
            Err(error) => {
                let failure = failure_from_core(error);
                ChildWorkflowHandle {
                    started: Promise::ready(Err(failure.clone())),
                    result: Promise::ready(Err(failure)),
                }
            }
        }
    }

    /// Signal an external workflow execution.
    pub fn signal_external_workflow(
        &self,
        workflow_id: &str,
        signal_name: &str,
        input: Option<Value>,
    ) -> Promise<()> {
        let machines = match self.machines() {
            Ok(machines) => machines,
            Err(failure) => return Promise::ready(Err(failure)),
        };
        let attributes = SignalExternalWorkflowExecutionAttributes {
            workflow_id: workflow_id.to_string(),
            signal_name: signal_name.to_string(),
            input,
            child_workflow_only: false,
        };
        let (promise, completer) = Promise::pending();
        let created = machines.signal_external_workflow_execution(
            attributes,
            Box::new(move |result| completer.complete_with(result)),
        );
        match created {
            Ok(handle) => {
                let cancel = CancelOnce::new(handle);
                self.register_cancel(&cancel);
                promise.with_cancel(cancel)
            }
            Err(error) => Promise::ready(Err(failure_from_core(error))),
        }
    }

    /// Request cancellation of an external workflow execution.
    pub fn request_cancel_external_workflow(&self, workflow_id: &str) -> Promise<()> {
        let machines = match self.machines() {
            Ok(machines) => machines,
            Err(failure) => return Promise::ready(Err(failure)),
        };
        let attributes = RequestCancelExternalWorkflowExecutionAttributes {
            workflow_id: workflow_id.to_string(),
            child_workflow_only: false,
        };
        let (promise, completer) = Promise::pending();
        let created = machines.request_cancel_external_workflow_execution(
            attributes,
            Box::new(move |result| completer.complete_with(result)),
        );
        match created {
            Ok(()) => promise,
            Err(error) => Promise::ready(Err(failure_from_core(error))),
        }
    }

    /// Record a side effect: `func` runs exactly once, on first execution;
    /// every replay observes the recorded value.
    pub fn side_effect(&self, func: impl FnOnce() -> Value + Send + 'static) -> Promise<Value> {
        let machines = match self.machines() {
            Ok(machines) => machines,
            Err(failure) => return Promise::ready(Err(failure)),
        };
        let (promise, completer) = Promise::pending();
        let created = machines.side_effect(
            Box::new(func),
            Box::new(move |value| completer.complete(value)),
        );
        match created {
            Ok(()) => promise,
            Err(error) => Promise::ready(Err(failure_from_core(error))),
        }
    }

    /// Keyed mutable side effect: `func` sees the last recorded value and a
    /// marker is recorded only when its result differs.
    pub fn mutable_side_effect(
        &self,
        id: &str,
        func: impl FnOnce(Option<&Value>) -> Option<Value> + Send + 'static,
    ) -> Promise<Value> {
        let machines = match self.machines() {
            Ok(machines) => machines,
            Err(failure) => return Promise::ready(Err(failure)),
        };
        let (promise, completer) = Promise::pending();
        let id_for_error = id.to_string();
        let created = machines.mutable_side_effect(
            id,
            Box::new(func),
            Box::new(move |value| match value {
                Some(value) => completer.complete(value),
                None => completer.fail(Failure::application(
                    "mutable-side-effect",
                    format!("mutable side effect '{id_for_error}' has no recorded value"),
                    true,
                    None,
                )),
            }),
        );
        match created {
            Ok(()) => promise,
            Err(error) => Promise::ready(Err(failure_from_core(error))),
        }
    }

    /// Versioned branch point. First execution records `max_supported`;
    /// replays observe the recorded version, and fail deterministically when
    /// it falls outside `[min_supported, max_supported]`.
    pub fn get_version(
        &self,
        change_id: &str,
        min_supported: i32,
        max_supported: i32,
    ) -> Promise<i32> {
        let machines = match self.machines() {
            Ok(machines) => machines,
            Err(failure) => return Promise::ready(Err(failure)),
        };
        let (promise, completer) = Promise::pending();
        let created = machines.get_version(
            change_id,
            min_supported,
            max_supported,
            Box::new(move |result| completer.complete_with(result)),
        );
        match created {
            Ok(()) => promise,
            Err(error) => Promise::ready(Err(failure_from_core(error))),
        }
    }

    /// Upsert workflow search attributes.
    pub fn upsert_search_attributes(
        &self,
        search_attributes: BTreeMap<String, Value>,
    ) -> Result<(), Failure> {
        self.machines()?
            .upsert_search_attributes(UpsertWorkflowSearchAttributesAttributes {
                search_attributes,
            })
            .map_err(failure_from_core)
    }

    /// Close this run and continue as a new execution. Returns the failure
    /// value workflow code should return; the runner recognises that a
    /// workflow-closing command was already emitted.
    pub fn continue_as_new(&self, workflow_type: &str, input: Option<Value>) -> Failure {
        let attributes = ContinueAsNewWorkflowExecutionAttributes {
            workflow_type: workflow_type.to_string(),
            input,
        };
        let machines = match self.machines() {
            Ok(machines) => machines,
            Err(failure) => return failure,
        };
        match machines.continue_as_new_workflow(attributes) {
            Ok(()) => Failure::terminated("workflow continued as new"),
            Err(error) => failure_from_core(error),
        }
    }

    // =========================================================================
    // Signals
    // =========================================================================

    /// Await the next delivery of the named signal. Queued deliveries are
    /// consumed in history order.
    pub fn wait_signal(&self, signal_name: &str) -> Promise<Option<Value>> {
        let mut signals = self.inner.signals.lock();
        let channel = signals
            .entry(signal_name.to_string())
            .or_insert_with(|| SignalChannel {
                queued: VecDeque::new(),
                waiters: VecDeque::new(),
            });
        if let Some(input) = channel.queued.pop_front() {
            return Promise::ready(Ok(input));
        }
        let (promise, completer) = Promise::pending();
        channel.waiters.push_back(completer);
        promise
    }

    pub(crate) fn deliver_signal(&self, signal_name: &str, input: Option<Value>) {
        let mut signals = self.inner.signals.lock();
        let channel = signals
            .entry(signal_name.to_string())
            .or_insert_with(|| SignalChannel {
                queued: VecDeque::new(),
                waiters: VecDeque::new(),
            });
        if let Some(waiter) = channel.waiters.pop_front() {
            waiter.complete(input);
        } else {
            channel.queued.push_back(input);
        }
    }

    // =========================================================================
    // Deterministic values and predicates
    // =========================================================================

    /// Yield until `predicate` becomes true; re-evaluated once per
    /// event-loop pass.
    pub fn block_until(
        &self,
        predicate: impl Fn() -> bool + Send + 'static,
    ) -> impl Future<Output = ()> + Send {
        BlockUntil {
            predicate: Box::new(predicate),
        }
    }

    /// Deterministic name-based UUID; stable across replays.
    pub fn random_uuid(&self) -> Result<Uuid, Failure> {
        self.machines()?.random_uuid().map_err(failure_from_core)
    }

    /// Deterministic random generator; stable across replays.
    pub fn new_random(&self) -> Result<DeterministicRng, Failure> {
        self.machines()?.new_random().map_err(failure_from_core)
    }

    /// Workflow time: never wall-clock, never decreasing.
    pub fn current_time_millis(&self) -> i64 {
        self.inner
            .machines
            .upgrade()
            .map(|machines| machines.current_time_millis())
            .unwrap_or(0)
    }

    pub fn is_replaying(&self) -> bool {
        self.inner
            .machines
            .upgrade()
            .is_some_and(|machines| machines.is_replaying())
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::SeqCst)
    }

    /// Replay-aware metrics bound to this execution's replay flag and clock.
    pub fn metrics(&self) -> ReplayAwareScope {
        let machines: Weak<WorkflowStateMachines> = self.inner.machines.clone();
        let clock_machines = machines.clone();
        ReplayAwareScope::new(
            self.inner.metrics.clone(),
            Arc::new(move || machines.upgrade().is_some_and(|m| m.is_replaying())),
            Arc::new(move || {
                clock_machines
                    .upgrade()
                    .map(|m| m.current_time_millis())
                    .unwrap_or(0)
            }),
        )
    }

    // =========================================================================
    // Cancellation scopes
    // =========================================================================

    /// A child scope of the current scope.
    pub fn new_cancellation_scope(&self) -> CancellationScope {
        self.inner.current_scope.lock().new_child()
    }

    /// Run `f` with `scope` as the current scope: operations created inside
    /// register their cancellation with it.
    pub fn with_scope<R>(&self, scope: &CancellationScope, f: impl FnOnce() -> R) -> R {
        let previous = {
            let mut current = self.inner.current_scope.lock();
            std::mem::replace(&mut *current, scope.clone())
        };
        let result = f();
        *self.inner.current_scope.lock() = previous;
        result
    }

    pub(crate) fn request_cancel(&self) {
        self.inner.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn cancel_root_scope(&self) {
        self.inner.root_scope.cancel();
    }
}

struct BlockUntil {
    predicate: Box<dyn Fn() -> bool + Send>,
}

impl Future for BlockUntil {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if (self.predicate)() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

fn activity_outcome(
    activity_type: &str,
    activity_id: &str,
    resolution: ActivityResolution,
) -> Result<Option<Value>, Failure> {
    let wrap = |message: String, cause: Failure| Failure {
        message,
        cause: Some(Box::new(cause)),
        info: FailureInfo::Activity {
            activity_id: activity_id.to_string(),
            activity_type: activity_type.to_string(),
            scheduled_event_id: 0,
        },
    };
    match resolution {
        ActivityResolution::Completed { result } => Ok(result),
        ActivityResolution::Failed { failure } => Err(wrap(
            format!("activity '{activity_type}' failed"),
            failure,
        )),
        ActivityResolution::TimedOut { failure } => Err(wrap(
            format!("activity '{activity_type}' timed out"),
            failure,
        )),
        ActivityResolution::Canceled { .. } => Err(Failure::canceled(format!(
            "activity '{activity_type}' cancelled"
        ))),
    }
}

fn child_outcome(
    workflow_type: &str,
    workflow_id: &str,
    resolution: ChildWorkflowResolution,
) -> Result<Option<Value>, Failure> {
    let wrap = |message: String, cause: Option<Failure>| Failure {
        message,
        cause: cause.map(Box::new),
        info: FailureInfo::ChildWorkflowExecution {
            workflow_id: workflow_id.to_string(),
            workflow_type: workflow_type.to_string(),
            initiated_event_id: 0,
        },
    };
    match resolution {
        ChildWorkflowResolution::Completed { result } => Ok(result),
        ChildWorkflowResolution::Failed { failure } => Err(wrap(
            format!("child workflow '{workflow_type}' failed"),
            Some(failure),
        )),
        ChildWorkflowResolution::Canceled { .. } => Err(Failure::canceled(format!(
            "child workflow '{workflow_type}' cancelled"
        ))),
        ChildWorkflowResolution::TimedOut { timeout_type } => Err(wrap(
            format!("child workflow '{workflow_type}' timed out"),
            Some(Failure::timeout(timeout_type)),
        )),
        ChildWorkflowResolution::Terminated => Err(wrap(
            format!("child workflow '{workflow_type}' was terminated"),
            Some(Failure::terminated("terminated by the service")),
        )),
        ChildWorkflowResolution::StartFailed { cause, .. } => Err(Failure::application(
            "child-workflow-start-failed",
            format!("child workflow '{workflow_type}' failed to start: {cause:?}"),
            true,
            None,
        )),
    }
}
