//! Groups streamed history events into workflow-task-sized batches.
//!
//! A batch must contain everything belonging to one workflow-task attempt:
//! the prior task's completed event, the command events recorded after it,
//! any external events, and the next task's scheduled/started pair. Version
//! markers are preloaded over a whole batch before any event in it is
//! dispatched, which is only sound if the marker events travel in the same
//! batch as the started event that runs the workflow code consuming them.

use crate::history::{EventType, HistoryEvent};

#[derive(Default)]
pub(crate) struct WftBuffer {
    buffer: Vec<HistoryEvent>,
    ready: Vec<HistoryEvent>,
}

impl WftBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one event. Returns true when a complete batch is ready to fetch.
    pub fn add_event(&mut self, event: &HistoryEvent, has_next: bool) -> bool {
        // A started event followed by the task's completed event closes the
        // batch at the started event; the completed event opens the next
        // batch. Started followed by failed/timed-out stays buffered: the
        // failed attempt is delivered together with the following batch.
        let closes_previous = event.event_type() == EventType::WorkflowTaskCompleted
            && self
                .buffer
                .last()
                .is_some_and(|last| last.event_type() == EventType::WorkflowTaskStarted);
        if closes_previous {
            self.ready.append(&mut self.buffer);
        }

        self.buffer.push(event.clone());

        if !has_next {
            self.ready.append(&mut self.buffer);
        }
        !self.ready.is_empty()
    }

    /// Drain the ready batch.
    pub fn fetch(&mut self) -> Vec<HistoryEvent> {
        std::mem::take(&mut self.ready)
    }
}
