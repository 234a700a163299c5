//! Error types for the replay engine.

use thiserror::Error;

/// One-line replay state descriptor attached to workflow-task errors for
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStateSnapshot {
    pub previous_started_event_id: i64,
    pub workflow_task_started_event_id: i64,
    pub current_started_event_id: i64,
}

impl std::fmt::Display for ReplayStateSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{PreviousStartedEventId={}, WorkflowTaskStartedEventId={}, CurrentStartedEventId={}}}",
            self.previous_started_event_id,
            self.workflow_task_started_event_id,
            self.current_started_event_id
        )
    }
}

/// Errors surfaced by the workflow state machines.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A recorded event cannot be reconciled with a generated command: wrong
    /// order, wrong type, wrong identifier, unknown initiating event or an
    /// unmatched version marker. The transport fails the workflow task; the
    /// service re-delivers it.
    #[error("nondeterministic workflow execution: {0}")]
    NonDeterministic(String),

    /// Any other unexpected failure inside the coordinator.
    #[error("workflow task failure: {message}")]
    WorkflowTask {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The service reported less progress than this worker has already
    /// handled. The cached coordinator must be discarded.
    #[error(
        "server history is behind worker progress \
         (previous_started_event_id={previous_started_event_id} < \
         current_started_event_id={current_started_event_id}), cached state must be discarded"
    )]
    ProgressRegression {
        previous_started_event_id: i64,
        current_started_event_id: i64,
    },

    /// An operation was used outside of its contract, e.g. a workflow
    /// operation invoked while the event loop is not running.
    #[error("illegal state: {0}")]
    IllegalState(String),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn is_non_deterministic(&self) -> bool {
        matches!(self, Self::NonDeterministic(_))
    }
}
