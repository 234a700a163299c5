//! # Kairos SDK for Rust
//!
//! The workflow authoring surface over the `kairos-core` replay engine.
//! Workflow code is written as async functions against a
//! [`WorkflowContext`]; the SDK runs them on a cooperative single-threaded
//! runner whose only suspension points are awaits on [`Promise`]s backed by
//! entity state machines. Replaying a recorded history re-runs the same code
//! and resolves the same promises with the same values, in the same order.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use kairos_sdk::prelude::*;
//!
//! let mut registry = WorkflowRegistry::new();
//! registry.register("greeter", |ctx, _input| {
//!     Box::pin(async move {
//!         ctx.timer(Duration::from_secs(5)).await?;
//!         let name = ctx.wait_signal("name").await?;
//!         Ok(name)
//!     })
//! });
//!
//! let worker = ReplayWorker::new(registry);
//! let result = worker.process_workflow_task(activation)?;
//! // result.commands go back to the orchestration service
//! ```
//!
//! ## Modules
//!
//! - [`context`] - workflow context, options and child-workflow handles
//! - [`promise`] - write-once promises with chaining and cancellation
//! - [`combinators`] - `all` / `any` over promises
//! - [`cancellation`] - cancellation scopes with exactly-once cascade
//! - [`runner`] - workflow registry and the cooperative runner
//! - [`worker`] - the replay worker and its dispatcher channel
//! - [`stub`] - typed stubs and the async invocation shim
//! - [`local_activity`] - local activity execution under retry policies
//! - [`replay_aware`] - metrics that stay silent during replay

pub mod cancellation;
pub mod combinators;
pub mod context;
pub mod error;
pub mod local_activity;
pub mod promise;
pub mod replay_aware;
pub mod runner;
pub mod stub;
pub mod worker;

pub use cancellation::CancellationScope;
pub use combinators::{all, any};
pub use context::{
    ActivityOptions, ChildWorkflowHandle, ChildWorkflowOptions, LocalActivityOptions,
    WorkflowContext, WorkflowInfo,
};
pub use error::{KairosError, Result};
pub use promise::{Promise, PromiseCompleter};
pub use replay_aware::{MetricsScope, NoopMetricsScope, ReplayAwareScope};
pub use runner::{BoxWorkflowFuture, WorkflowFunction, WorkflowRegistry, WorkflowResult};
pub use stub::{execute_async, is_stub_invocation, ActivityStub, ChildWorkflowStub, StubInvocation};
pub use worker::{ReplayWorker, WorkflowActivation, WorkflowDispatcher, WorkflowTaskResult};

/// Convenience imports for workflow authors.
pub mod prelude {
    pub use crate::cancellation::CancellationScope;
    pub use crate::combinators::{all, any};
    pub use crate::context::{
        ActivityOptions, ChildWorkflowOptions, LocalActivityOptions, WorkflowContext,
    };
    pub use crate::promise::Promise;
    pub use crate::runner::WorkflowRegistry;
    pub use crate::stub::{execute_async, ActivityStub, ChildWorkflowStub};
    pub use crate::worker::{ReplayWorker, WorkflowActivation};
    pub use kairos_core::{
        ActivityCancellationType, ChildWorkflowCancellationType, Failure, RetryOptions,
    };
}
