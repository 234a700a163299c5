//! Replay worker: the contract with the transport.
//!
//! The transport delivers one workflow task at a time: a slice of history
//! plus the two started-event ids. The worker keeps one coordinator/runner
//! pair per cached run, feeds the events through, and returns the commands
//! and local-activity requests produced by the task. A failed task evicts
//! the cached execution; the service retries with full history.
//!
//! The dispatcher wraps a worker in a single-consumer channel so that the
//! transport threads never touch a coordinator directly.

use crate::error::KairosError;
use crate::replay_aware::{MetricsScope, NoopMetricsScope};
use crate::runner::{WorkflowRegistry, WorkflowRunner};
use kairos_core::{
    Command, ExecuteLocalActivityParameters, HistoryEvent, LocalActivityExecutionResult,
    WorkflowStateMachines,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// One unit of work delivered by the transport.
#[derive(Debug, Clone)]
pub struct WorkflowActivation {
    pub run_id: String,
    pub events: Vec<HistoryEvent>,
    /// Started event id of the last workflow task known completed by the
    /// service.
    pub previous_started_event_id: i64,
    /// Started event id of the task being processed now.
    pub workflow_task_started_event_id: i64,
}

/// Output of one processed workflow task.
#[derive(Debug, Clone, Default)]
pub struct WorkflowTaskResult {
    pub commands: Vec<Command>,
    pub local_activity_requests: Vec<ExecuteLocalActivityParameters>,
}

#[derive(Clone)]
struct CachedExecution {
    // The runner stays alive through the coordinator's listener reference.
    machines: Arc<WorkflowStateMachines>,
}

/// Processes workflow tasks against cached executions.
pub struct ReplayWorker {
    registry: WorkflowRegistry,
    metrics: Arc<dyn MetricsScope>,
    executions: Mutex<HashMap<String, CachedExecution>>,
}

impl ReplayWorker {
    pub fn new(registry: WorkflowRegistry) -> Self {
        Self::with_metrics(registry, Arc::new(NoopMetricsScope))
    }

    pub fn with_metrics(registry: WorkflowRegistry, metrics: Arc<dyn MetricsScope>) -> Self {
        Self {
            registry,
            metrics,
            executions: Mutex::new(HashMap::new()),
        }
    }

    /// Process one workflow task. On error the cached execution is
    /// discarded; the caller fails the task and the service re-delivers it
    /// with full history.
    pub fn process_workflow_task(
        &self,
        activation: WorkflowActivation,
    ) -> Result<WorkflowTaskResult, KairosError> {
        let execution = self.execution_for(&activation.run_id);
        let result = Self::drive(&execution, &activation);
        if result.is_err() {
            self.evict(&activation.run_id);
        }
        result
    }

    fn execution_for(&self, run_id: &str) -> CachedExecution {
        let mut executions = self.executions.lock();
        executions
            .entry(run_id.to_string())
            .or_insert_with(|| {
                let runner = WorkflowRunner::new(self.registry.clone(), self.metrics.clone());
                let machines = WorkflowStateMachines::new(runner.clone());
                runner.attach(&machines);
                CachedExecution { machines }
            })
            .clone()
    }

    fn drive(
        execution: &CachedExecution,
        activation: &WorkflowActivation,
    ) -> Result<WorkflowTaskResult, KairosError> {
        execution.machines.set_started_ids(
            activation.previous_started_event_id,
            activation.workflow_task_started_event_id,
        )?;
        let count = activation.events.len();
        for (index, event) in activation.events.iter().enumerate() {
            execution.machines.handle_event(event, index + 1 < count)?;
        }
        Ok(WorkflowTaskResult {
            commands: execution.machines.take_commands(),
            local_activity_requests: execution.machines.take_local_activity_requests(),
        })
    }

    /// Report a local activity completion; returns the commands and
    /// requests that became available, so the caller can decide whether the
    /// task can close.
    pub fn complete_local_activity(
        &self,
        run_id: &str,
        result: LocalActivityExecutionResult,
    ) -> Result<WorkflowTaskResult, KairosError> {
        let execution = {
            let executions = self.executions.lock();
            executions
                .get(run_id)
                .cloned()
                .ok_or_else(|| KairosError::IllegalState(format!("unknown run: {run_id}")))?
        };
        execution.machines.handle_local_activity_completion(result)?;
        Ok(WorkflowTaskResult {
            commands: execution.machines.take_commands(),
            local_activity_requests: execution.machines.take_local_activity_requests(),
        })
    }

    /// Drop the cached execution for a run.
    pub fn evict(&self, run_id: &str) {
        self.executions.lock().remove(run_id);
    }

    pub fn cached_execution_count(&self) -> usize {
        self.executions.lock().len()
    }
}

/// A queued activation plus its response channel.
pub struct ActivationRequest {
    pub activation: WorkflowActivation,
    pub respond_to: oneshot::Sender<Result<WorkflowTaskResult, KairosError>>,
}

/// Single-consumer dispatch front for a [`ReplayWorker`]: transport threads
/// enqueue activations, one task drains them in order.
#[derive(Clone)]
pub struct WorkflowDispatcher {
    sender: mpsc::UnboundedSender<ActivationRequest>,
}

impl WorkflowDispatcher {
    /// Spawn the dispatch loop on the current tokio runtime.
    pub fn spawn(worker: ReplayWorker) -> (Self, tokio::task::JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ActivationRequest>();
        let handle = tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                let run_id = request.activation.run_id.clone();
                let result = worker.process_workflow_task(request.activation);
                if let Err(error) = &result {
                    tracing::warn!(%run_id, %error, "workflow task failed");
                }
                let _ = request.respond_to.send(result);
            }
        });
        (Self { sender }, handle)
    }

    /// Process an activation through the dispatch loop.
    pub async fn process(
        &self,
        activation: WorkflowActivation,
    ) -> Result<WorkflowTaskResult, KairosError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(ActivationRequest {
                activation,
                respond_to,
            })
            .map_err(|_| KairosError::IllegalState("dispatcher stopped".to_string()))?;
        response
            .await
            .map_err(|_| KairosError::IllegalState("dispatcher dropped the request".to_string()))?
    }
}
