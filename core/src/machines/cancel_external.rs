//! Requests cancellation of an external (or child) workflow execution.

use super::definition::{Machine, StateMachineDefinition, StateMachineSink, Trigger};
use super::{EffectBuffer, ExternalOperationCallback, MachineData};
use crate::command::{
    Command, CommandAttributes, CommandType, RequestCancelExternalWorkflowExecutionAttributes,
};
use crate::error::CoreResult;
use crate::failure::Failure;
use crate::history::{EventAttributes, EventType, HistoryEvent};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum State {
    Created,
    CommandCreated,
    InitiatedEventRecorded,
    CancelRequested,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Explicit {
    Schedule,
}

pub(crate) struct CancelExternalData {
    attributes: RequestCancelExternalWorkflowExecutionAttributes,
    completion: Option<ExternalOperationCallback>,
    current_event: Option<HistoryEvent>,
    out: EffectBuffer,
}

impl CancelExternalData {
    fn notify(&mut self, result: Result<(), Failure>) {
        if let Some(callback) = self.completion.take() {
            self.out.callback(move || callback(result));
        }
    }

    fn notify_failed(&mut self) {
        let cause = match self.current_event.as_ref().map(|e| &e.attributes) {
            Some(EventAttributes::RequestCancelExternalWorkflowExecutionFailed {
                cause, ..
            }) => cause.clone(),
            _ => "unknown".to_string(),
        };
        let workflow_id = self.attributes.workflow_id.clone();
        self.notify(Err(Failure::application(
            "request-cancel-external-workflow-failed",
            format!("cancel request for workflow '{workflow_id}' failed: {cause}"),
            true,
            None,
        )));
    }
}

impl MachineData for CancelExternalData {
    fn out(&mut self) -> &mut EffectBuffer {
        &mut self.out
    }

    fn set_current_event(&mut self, event: &HistoryEvent) {
        self.current_event = Some(event.clone());
    }
}

pub(crate) type CancelExternalMachine = Machine<State, Explicit, CancelExternalData>;

fn definition() -> &'static StateMachineDefinition<State, Explicit, CancelExternalData> {
    static DEFINITION: OnceLock<StateMachineDefinition<State, Explicit, CancelExternalData>> =
        OnceLock::new();
    DEFINITION.get_or_init(|| {
        StateMachineDefinition::new(
            "CancelExternal",
            State::Created,
            &[State::CancelRequested, State::Failed],
        )
        .add_with(
            State::Created,
            Trigger::Explicit(Explicit::Schedule),
            State::CommandCreated,
            |data: &mut CancelExternalData| {
                data.out.add_command(Command::new(
                    CommandAttributes::RequestCancelExternalWorkflowExecution(
                        data.attributes.clone(),
                    ),
                ));
            },
        )
        .add(
            State::CommandCreated,
            Trigger::Command(CommandType::RequestCancelExternalWorkflowExecution),
            State::CommandCreated,
        )
        .add(
            State::CommandCreated,
            Trigger::Event(EventType::RequestCancelExternalWorkflowExecutionInitiated),
            State::InitiatedEventRecorded,
        )
        .add_with(
            State::InitiatedEventRecorded,
            Trigger::Event(EventType::ExternalWorkflowExecutionCancelRequested),
            State::CancelRequested,
            |data| data.notify(Ok(())),
        )
        .add_with(
            State::InitiatedEventRecorded,
            Trigger::Event(EventType::RequestCancelExternalWorkflowExecutionFailed),
            State::Failed,
            CancelExternalData::notify_failed,
        )
    })
}

pub(crate) fn new_machine(
    attributes: RequestCancelExternalWorkflowExecutionAttributes,
    completion: ExternalOperationCallback,
    sink: Option<StateMachineSink>,
) -> CoreResult<CancelExternalMachine> {
    let mut machine = Machine::new(
        definition(),
        CancelExternalData {
            attributes,
            completion: Some(completion),
            current_event: None,
            out: EffectBuffer::default(),
        },
        sink,
    );
    machine.fire(Trigger::Explicit(Explicit::Schedule))?;
    Ok(machine)
}

#[cfg(test)]
mod tests {
    use super::super::EntityStateMachine;
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn attributes() -> RequestCancelExternalWorkflowExecutionAttributes {
        RequestCancelExternalWorkflowExecutionAttributes {
            workflow_id: "child-wf".to_string(),
            child_workflow_only: true,
        }
    }

    #[test]
    fn test_cancel_requested_resolves_ok() {
        let result: Arc<Mutex<Option<Result<(), Failure>>>> = Arc::new(Mutex::new(None));
        let captured = result.clone();
        let mut machine = new_machine(
            attributes(),
            Box::new(move |r| *captured.lock() = Some(r)),
            None,
        )
        .unwrap();
        let effects = machine.take_effects();
        assert_eq!(
            effects.commands[0].command.command_type(),
            CommandType::RequestCancelExternalWorkflowExecution
        );

        let initiated = HistoryEvent::new(
            12,
            Utc::now(),
            EventAttributes::RequestCancelExternalWorkflowExecutionInitiated(attributes()),
        );
        machine.handle_event(&initiated, true).unwrap();

        let requested = HistoryEvent::new(
            15,
            Utc::now(),
            EventAttributes::ExternalWorkflowExecutionCancelRequested {
                initiated_event_id: 12,
                workflow_id: "child-wf".to_string(),
            },
        );
        machine.handle_event(&requested, true).unwrap();
        for callback in machine.take_effects().callbacks {
            callback();
        }
        assert!(matches!(*result.lock(), Some(Ok(()))));
        assert!(machine.is_final_state());
    }

    #[test]
    fn test_failed_request_resolves_with_failure() {
        let result: Arc<Mutex<Option<Result<(), Failure>>>> = Arc::new(Mutex::new(None));
        let captured = result.clone();
        let mut machine = new_machine(
            attributes(),
            Box::new(move |r| *captured.lock() = Some(r)),
            None,
        )
        .unwrap();
        let _ = machine.take_effects();

        let initiated = HistoryEvent::new(
            12,
            Utc::now(),
            EventAttributes::RequestCancelExternalWorkflowExecutionInitiated(attributes()),
        );
        machine.handle_event(&initiated, true).unwrap();

        let failed = HistoryEvent::new(
            15,
            Utc::now(),
            EventAttributes::RequestCancelExternalWorkflowExecutionFailed {
                initiated_event_id: 12,
                workflow_id: "child-wf".to_string(),
                cause: "EXTERNAL_WORKFLOW_EXECUTION_NOT_FOUND".to_string(),
            },
        );
        machine.handle_event(&failed, true).unwrap();
        for callback in machine.take_effects().callbacks {
            callback();
        }
        let guard = result.lock();
        assert!(guard.as_ref().unwrap().is_err());
    }
}
