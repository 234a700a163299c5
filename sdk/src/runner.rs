//! Cooperative single-threaded workflow runner.
//!
//! Workflow code is an async function polled with a noop waker, exclusively
//! from inside the coordinator's event loop. One poll per pass is enough:
//! promises resolve synchronously from machine callbacks before the poll, so
//! the code runs through every ready await and parks at the first pending
//! one. No true parallelism ever exists for workflow code.

use crate::context::{WorkflowContext, WorkflowInfo};
use crate::replay_aware::MetricsScope;
use kairos_core::{EventAttributes, Failure, HistoryEvent, StateMachinesListener, WorkflowStateMachines};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

/// Result of one workflow execution.
pub type WorkflowResult = Result<Option<Value>, Failure>;

/// Boxed workflow code.
pub type BoxWorkflowFuture = Pin<Box<dyn Future<Output = WorkflowResult> + Send>>;

/// Factory invoked once per execution when its started event is processed.
pub type WorkflowFunction =
    Arc<dyn Fn(WorkflowContext, Option<Value>) -> BoxWorkflowFuture + Send + Sync>;

/// Registry of workflow functions by workflow type.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    functions: HashMap<String, WorkflowFunction>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        workflow_type: &str,
        function: impl Fn(WorkflowContext, Option<Value>) -> BoxWorkflowFuture + Send + Sync + 'static,
    ) {
        self.functions
            .insert(workflow_type.to_string(), Arc::new(function));
    }

    pub fn get(&self, workflow_type: &str) -> Option<WorkflowFunction> {
        self.functions.get(workflow_type).cloned()
    }
}

struct RunnerState {
    context: Option<WorkflowContext>,
    task: Option<BoxWorkflowFuture>,
    done: bool,
    pending_cancel: bool,
    startup_failure: Option<Failure>,
}

/// Drives one workflow execution; implements the coordinator listener.
pub(crate) struct WorkflowRunner {
    registry: WorkflowRegistry,
    metrics: Arc<dyn MetricsScope>,
    machines: Mutex<Weak<WorkflowStateMachines>>,
    state: Mutex<RunnerState>,
}

impl WorkflowRunner {
    pub fn new(registry: WorkflowRegistry, metrics: Arc<dyn MetricsScope>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            metrics,
            machines: Mutex::new(Weak::new()),
            state: Mutex::new(RunnerState {
                context: None,
                task: None,
                done: false,
                pending_cancel: false,
                startup_failure: None,
            }),
        })
    }

    pub fn attach(&self, machines: &Arc<WorkflowStateMachines>) {
        *self.machines.lock() = Arc::downgrade(machines);
    }

    fn machines(&self) -> Option<Arc<WorkflowStateMachines>> {
        self.machines.lock().upgrade()
    }

    fn context(&self) -> Option<WorkflowContext> {
        self.state.lock().context.clone()
    }
}

impl StateMachinesListener for WorkflowRunner {
    fn start(&self, event: &HistoryEvent) {
        let EventAttributes::WorkflowExecutionStarted {
            workflow_id,
            workflow_type,
            original_execution_run_id,
            input,
        } = &event.attributes
        else {
            return;
        };
        let Some(machines) = self.machines() else {
            return;
        };
        match self.registry.get(workflow_type) {
            Some(function) => {
                let context = WorkflowContext::new(
                    machines,
                    WorkflowInfo {
                        workflow_id: workflow_id.clone(),
                        workflow_type: workflow_type.clone(),
                        run_id: original_execution_run_id.clone(),
                    },
                    self.metrics.clone(),
                );
                let task = function(context.clone(), input.clone());
                let mut state = self.state.lock();
                state.context = Some(context);
                state.task = Some(task);
            }
            None => {
                tracing::warn!(workflow_type, "no workflow function registered");
                self.state.lock().startup_failure = Some(Failure::application(
                    "workflow-not-found",
                    format!("workflow type '{workflow_type}' is not registered"),
                    true,
                    None,
                ));
            }
        }
    }

    fn signal(&self, event: &HistoryEvent) {
        let EventAttributes::WorkflowExecutionSignaled { signal_name, input } = &event.attributes
        else {
            return;
        };
        if let Some(context) = self.context() {
            context.deliver_signal(signal_name, input.clone());
        }
    }

    fn cancel(&self, _event: &HistoryEvent) {
        // The scope cascade runs inside the next event-loop pass so that
        // cancellation handles are allowed to emit commands.
        let mut state = self.state.lock();
        state.pending_cancel = true;
        if let Some(context) = &state.context {
            context.request_cancel();
        }
    }

    fn workflow_timed_out(&self, event: &HistoryEvent) {
        tracing::info!(event_id = event.event_id, "workflow execution timed out");
        let mut state = self.state.lock();
        state.done = true;
        state.task = None;
    }

    fn event_loop(&self) {
        let Some(machines) = self.machines() else {
            return;
        };

        let (pending_cancel, startup_failure) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.pending_cancel),
                state.startup_failure.take(),
            )
        };
        if let Some(failure) = startup_failure {
            if let Err(error) = machines.fail_workflow(failure) {
                tracing::error!(%error, "failed to report workflow startup failure");
            }
            self.state.lock().done = true;
            return;
        }
        if pending_cancel {
            if let Some(context) = self.context() {
                context.cancel_root_scope();
            }
        }

        let task = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.task.take()
        };
        let Some(mut task) = task else {
            return;
        };

        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        match task.as_mut().poll(&mut cx) {
            Poll::Pending => {
                self.state.lock().task = Some(task);
            }
            Poll::Ready(result) => {
                self.state.lock().done = true;
                if machines.has_terminal_command() {
                    // Continue-as-new (or another closing command) was
                    // already produced by workflow code.
                    return;
                }
                let completion = match result {
                    Ok(output) => machines.complete_workflow(output),
                    Err(failure) => {
                        let cancel_requested = self
                            .context()
                            .map(|c| c.is_cancel_requested())
                            .unwrap_or(false);
                        if failure.is_canceled() && cancel_requested {
                            machines.cancel_workflow(None)
                        } else {
                            machines.fail_workflow(failure)
                        }
                    }
                };
                if let Err(error) = completion {
                    tracing::error!(%error, "failed to emit workflow-closing command");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let mut registry = WorkflowRegistry::new();
        registry.register("greeter", |_context, input| {
            Box::pin(async move { Ok(input) })
        });
        assert!(registry.get("greeter").is_some());
        assert!(registry.get("unknown").is_none());
    }
}
