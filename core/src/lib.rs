//! # Kairos Core
//!
//! Deterministic workflow replay engine: the worker-side core that turns an
//! ordered stream of history events for a single workflow execution into
//! calls on workflow code, and turns the side effects of that code into new
//! commands for the orchestration service.
//!
//! A workflow suspended for days is resumed by replaying its history; it must
//! observe identical values at identical points so that the code takes
//! identical branches. This crate provides the pieces that make that hold:
//!
//! - [`history`] - the event model and command-event classification
//! - [`command`] - commands and their type-specific attributes
//! - [`machines`] - one entity state machine per durable operation, plus the
//!   [`machines::WorkflowStateMachines`] coordinator that matches replayed
//!   events against generated commands and surfaces nondeterminism
//! - [`failure`] - the structured failure model carried across activity and
//!   child-workflow boundaries
//! - [`retry`] - retry policy evaluation
//! - [`markers`] - marker payloads used to persist side-effect results
//! - [`random`] - deterministic UUIDs and random generators
//! - [`testing`] - history builders for tests
//!
//! The user-facing workflow surface (promises, the cooperative runner,
//! workflow context and stubs) lives in the `kairos-sdk` crate.

pub mod command;
pub mod error;
pub mod failure;
pub mod history;
pub mod machines;
pub mod markers;
pub mod random;
pub mod retry;
pub mod testing;

pub use command::{Command, CommandAttributes, CommandType};
pub use error::{CoreError, CoreResult, ReplayStateSnapshot};
pub use failure::{Failure, FailureInfo, TimeoutType};
pub use history::{EventAttributes, EventType, HistoryEvent, WorkflowExecution};
pub use machines::{
    ActivityCancellationType, ActivityResolution, CancellationHandle,
    ChildWorkflowCancellationType, ChildWorkflowResolution, ExecuteLocalActivityParameters,
    LocalActivityExecutionResult, LocalActivityResolution, StateMachineSink,
    StateMachinesListener, TimerResolution, TransitionRecord, WorkflowStateMachines,
    DEFAULT_VERSION,
};
pub use random::DeterministicRng;
pub use retry::RetryOptions;
