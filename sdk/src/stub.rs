//! Stubs and the async invocation shim.
//!
//! Stubs are the typed call surface over activities and child workflows. A
//! method handle produced by a stub carries a marker capability (a sealed
//! trait) that [`execute_async`] requires, so only stub-originated
//! invocations can be turned into promises: plain closures and free
//! functions fail the check at compile time. [`is_stub_invocation`] is the
//! runtime witness of the same property for dynamic callers.

use crate::context::{ActivityOptions, ChildWorkflowOptions, WorkflowContext};
use crate::promise::Promise;
use serde_json::Value;
use std::any::Any;

mod sealed {
    pub trait Sealed {}
}

/// Marker capability implemented only by stub method handles.
pub trait StubInvocation: sealed::Sealed {
    type Output;

    /// Schedule the deferred call and return its promise.
    fn invoke(self) -> Promise<Self::Output>;
}

/// Turn a stub method handle into a promise without blocking on the result.
pub fn execute_async<I: StubInvocation>(invocation: I) -> Promise<I::Output> {
    invocation.invoke()
}

/// Runtime check for dynamic callers: true only for values produced by stub
/// methods.
pub fn is_stub_invocation(value: &dyn Any) -> bool {
    value.is::<ActivityInvocation>() || value.is::<ChildWorkflowInvocation>()
}

/// Typed call surface over activities sharing one set of options.
pub struct ActivityStub {
    context: WorkflowContext,
    options: ActivityOptions,
}

impl ActivityStub {
    pub fn new(context: &WorkflowContext, options: ActivityOptions) -> Self {
        Self {
            context: context.clone(),
            options,
        }
    }

    /// A deferred invocation, to be passed to [`execute_async`].
    pub fn method(&self, activity_type: &str, input: Option<Value>) -> ActivityInvocation {
        ActivityInvocation {
            context: self.context.clone(),
            options: self.options.clone(),
            activity_type: activity_type.to_string(),
            input,
        }
    }

    /// Schedule immediately; awaiting the promise gives the blocking call
    /// shape.
    pub fn execute(&self, activity_type: &str, input: Option<Value>) -> Promise<Option<Value>> {
        self.method(activity_type, input).invoke()
    }
}

/// Deferred activity call captured by a stub.
pub struct ActivityInvocation {
    context: WorkflowContext,
    options: ActivityOptions,
    activity_type: String,
    input: Option<Value>,
}

impl sealed::Sealed for ActivityInvocation {}

impl StubInvocation for ActivityInvocation {
    type Output = Option<Value>;

    fn invoke(self) -> Promise<Option<Value>> {
        self.context
            .schedule_activity(&self.activity_type, self.input, self.options)
    }
}

/// Typed call surface over child workflows sharing one set of options.
pub struct ChildWorkflowStub {
    context: WorkflowContext,
    options: ChildWorkflowOptions,
}

impl ChildWorkflowStub {
    pub fn new(context: &WorkflowContext, options: ChildWorkflowOptions) -> Self {
        Self {
            context: context.clone(),
            options,
        }
    }

    pub fn method(&self, workflow_type: &str, input: Option<Value>) -> ChildWorkflowInvocation {
        ChildWorkflowInvocation {
            context: self.context.clone(),
            options: self.options.clone(),
            workflow_type: workflow_type.to_string(),
            input,
        }
    }

    pub fn execute(&self, workflow_type: &str, input: Option<Value>) -> Promise<Option<Value>> {
        self.method(workflow_type, input).invoke()
    }
}

/// Deferred child workflow call captured by a stub.
pub struct ChildWorkflowInvocation {
    context: WorkflowContext,
    options: ChildWorkflowOptions,
    workflow_type: String,
    input: Option<Value>,
}

impl sealed::Sealed for ChildWorkflowInvocation {}

impl StubInvocation for ChildWorkflowInvocation {
    type Output = Option<Value>;

    fn invoke(self) -> Promise<Option<Value>> {
        self.context
            .start_child_workflow(&self.workflow_type, self.input, self.options)
            .result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_values_are_not_stub_invocations() {
        let closure = || 42;
        assert!(!is_stub_invocation(&closure));
        assert!(!is_stub_invocation(&"method-reference"));
        assert!(!is_stub_invocation(&0_u64));
    }
}
