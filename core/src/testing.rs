//! History builders for tests.
//!
//! Event ids are assigned sequentially starting at 1 and timestamps advance
//! by one second per event unless moved explicitly, which keeps workflow
//! time deterministic in assertions.

use crate::command::{
    RecordMarkerAttributes, RequestCancelExternalWorkflowExecutionAttributes,
    ScheduleActivityTaskAttributes, SignalExternalWorkflowExecutionAttributes,
    StartChildWorkflowExecutionAttributes, StartTimerAttributes,
};
use crate::failure::Failure;
use crate::history::{EventAttributes, HistoryEvent, WorkflowExecution};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::time::Duration;

/// Builds well-formed histories one event at a time.
pub struct HistoryBuilder {
    events: Vec<HistoryEvent>,
    next_event_id: i64,
    time_millis: i64,
    last_scheduled_event_id: i64,
    last_started_event_id: i64,
}

impl Default for HistoryBuilder {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            next_event_id: 1,
            time_millis: 1_700_000_000_000,
            last_scheduled_event_id: 0,
            last_started_event_id: 0,
        }
    }
}

impl HistoryBuilder {
    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<HistoryEvent> {
        self.events
    }

    /// Events after `from_event_id` (exclusive), for incremental delivery.
    pub fn events_after(&self, from_event_id: i64) -> Vec<HistoryEvent> {
        self.events
            .iter()
            .filter(|e| e.event_id > from_event_id)
            .cloned()
            .collect()
    }

    pub fn last_event_id(&self) -> i64 {
        self.next_event_id - 1
    }

    /// Pin the timestamp of subsequently added events.
    pub fn set_time_millis(&mut self, millis: i64) {
        self.time_millis = millis;
    }

    fn timestamp(&mut self) -> DateTime<Utc> {
        let at = self.time_millis;
        self.time_millis += 1_000;
        Utc.timestamp_millis_opt(at)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn add(&mut self, attributes: EventAttributes) -> i64 {
        let event_id = self.next_event_id;
        self.next_event_id += 1;
        let timestamp = self.timestamp();
        self.events
            .push(HistoryEvent::new(event_id, timestamp, attributes));
        event_id
    }

    pub fn add_workflow_execution_started(
        &mut self,
        workflow_id: &str,
        workflow_type: &str,
        run_id: &str,
        input: Option<Value>,
    ) -> i64 {
        self.add(EventAttributes::WorkflowExecutionStarted {
            workflow_id: workflow_id.to_string(),
            workflow_type: workflow_type.to_string(),
            original_execution_run_id: run_id.to_string(),
            input,
        })
    }

    pub fn add_workflow_task_scheduled(&mut self) -> i64 {
        let event_id = self.add(EventAttributes::WorkflowTaskScheduled);
        self.last_scheduled_event_id = event_id;
        event_id
    }

    pub fn add_workflow_task_started(&mut self) -> i64 {
        let scheduled_event_id = self.last_scheduled_event_id;
        let event_id = self.add(EventAttributes::WorkflowTaskStarted { scheduled_event_id });
        self.last_started_event_id = event_id;
        event_id
    }

    pub fn add_workflow_task_completed(&mut self) -> i64 {
        self.add(EventAttributes::WorkflowTaskCompleted {
            scheduled_event_id: self.last_scheduled_event_id,
            started_event_id: self.last_started_event_id,
        })
    }

    /// Scheduled + started pair, returning the started event id.
    pub fn add_workflow_task(&mut self) -> i64 {
        self.add_workflow_task_scheduled();
        self.add_workflow_task_started()
    }

    pub fn add_workflow_execution_signaled(&mut self, signal_name: &str, input: Option<Value>) -> i64 {
        self.add(EventAttributes::WorkflowExecutionSignaled {
            signal_name: signal_name.to_string(),
            input,
        })
    }

    pub fn add_workflow_execution_cancel_requested(&mut self, cause: &str) -> i64 {
        self.add(EventAttributes::WorkflowExecutionCancelRequested {
            cause: cause.to_string(),
        })
    }

    pub fn add_workflow_execution_completed(&mut self, result: Option<Value>) -> i64 {
        self.add(EventAttributes::WorkflowExecutionCompleted { result })
    }

    pub fn add_timer_started(&mut self, timer_id: &str, timeout: Duration) -> i64 {
        self.add(EventAttributes::TimerStarted(StartTimerAttributes {
            timer_id: timer_id.to_string(),
            start_to_fire_timeout: timeout,
        }))
    }

    pub fn add_timer_fired(&mut self, timer_id: &str, started_event_id: i64) -> i64 {
        self.add(EventAttributes::TimerFired {
            timer_id: timer_id.to_string(),
            started_event_id,
        })
    }

    pub fn add_activity_task_scheduled(
        &mut self,
        attributes: ScheduleActivityTaskAttributes,
    ) -> i64 {
        self.add(EventAttributes::ActivityTaskScheduled(attributes))
    }

    pub fn add_activity_task_started(&mut self, scheduled_event_id: i64, attempt: i32) -> i64 {
        self.add(EventAttributes::ActivityTaskStarted {
            scheduled_event_id,
            attempt,
        })
    }

    pub fn add_activity_task_completed(
        &mut self,
        scheduled_event_id: i64,
        result: Option<Value>,
    ) -> i64 {
        self.add(EventAttributes::ActivityTaskCompleted {
            scheduled_event_id,
            result,
        })
    }

    pub fn add_activity_task_failed(&mut self, scheduled_event_id: i64, failure: Failure) -> i64 {
        self.add(EventAttributes::ActivityTaskFailed {
            scheduled_event_id,
            failure,
        })
    }

    pub fn add_marker_recorded(&mut self, attributes: RecordMarkerAttributes) -> i64 {
        self.add(EventAttributes::MarkerRecorded(attributes))
    }

    pub fn add_child_workflow_initiated(
        &mut self,
        attributes: StartChildWorkflowExecutionAttributes,
    ) -> i64 {
        self.add(EventAttributes::StartChildWorkflowExecutionInitiated(
            attributes,
        ))
    }

    pub fn add_child_workflow_started(
        &mut self,
        initiated_event_id: i64,
        workflow_id: &str,
        run_id: &str,
    ) -> i64 {
        self.add(EventAttributes::ChildWorkflowExecutionStarted {
            initiated_event_id,
            workflow_execution: WorkflowExecution {
                workflow_id: workflow_id.to_string(),
                run_id: run_id.to_string(),
            },
        })
    }

    pub fn add_child_workflow_completed(
        &mut self,
        initiated_event_id: i64,
        result: Option<Value>,
    ) -> i64 {
        self.add(EventAttributes::ChildWorkflowExecutionCompleted {
            initiated_event_id,
            result,
        })
    }

    pub fn add_signal_external_initiated(
        &mut self,
        attributes: SignalExternalWorkflowExecutionAttributes,
    ) -> i64 {
        self.add(EventAttributes::SignalExternalWorkflowExecutionInitiated(
            attributes,
        ))
    }

    pub fn add_external_workflow_signaled(
        &mut self,
        initiated_event_id: i64,
        workflow_id: &str,
    ) -> i64 {
        self.add(EventAttributes::ExternalWorkflowExecutionSignaled {
            initiated_event_id,
            workflow_id: workflow_id.to_string(),
        })
    }

    pub fn add_request_cancel_external_initiated(
        &mut self,
        attributes: RequestCancelExternalWorkflowExecutionAttributes,
    ) -> i64 {
        self.add(EventAttributes::RequestCancelExternalWorkflowExecutionInitiated(attributes))
    }
}
