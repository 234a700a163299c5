//! Error types for the Kairos SDK

// Re-export core error types
pub use kairos_core::{CoreError, ReplayStateSnapshot};

use kairos_core::Failure;

/// Main error type for the Kairos SDK surface.
///
/// Workflow code itself deals in [`Failure`] values carried through promise
/// chains; `KairosError` is the worker-facing error of the processing APIs.
#[derive(Debug, thiserror::Error)]
pub enum KairosError {
    /// Replay engine error: nondeterminism, workflow-task failure, progress
    /// regression.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// No workflow function registered under the requested type.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An API was used outside of its contract.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result type alias for SDK operations
pub type Result<T> = std::result::Result<T, KairosError>;

/// Map an engine error onto a workflow-visible failure. Engine errors are
/// never retryable from inside workflow code.
pub fn failure_from_core(error: CoreError) -> Failure {
    Failure::application("workflow-engine", error.to_string(), true, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_is_transparent() {
        let error: KairosError = CoreError::NonDeterministic("boom".to_string()).into();
        assert!(error.to_string().contains("nondeterministic"));
        assert!(matches!(
            error,
            KairosError::Core(CoreError::NonDeterministic(_))
        ));
    }

    #[test]
    fn test_failure_from_core_is_non_retryable() {
        let failure = failure_from_core(CoreError::IllegalState("outside loop".to_string()));
        assert!(failure.is_non_retryable());
        assert!(failure.message.contains("outside loop"));
    }
}
