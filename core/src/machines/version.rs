//! Version (patch) marker machine, keyed by a user `change_id`.
//!
//! Markers are preloaded from each workflow-task batch before any event in
//! it is dispatched, so a `get_version` call replaying inside that batch
//! already knows the recorded version. A version marker whose `get_version`
//! call was removed from code is absorbed by the machine without consuming a
//! command, and without raising a nondeterminism error.

use super::{
    EffectBuffer, EntityStateMachine, HandleEventStatus, MachineEffects, VersionCallback,
};
use crate::command::{Command, CommandAttributes, CommandType};
use crate::error::CoreResult;
use crate::failure::Failure;
use crate::history::HistoryEvent;
use crate::markers;

/// Version observed by calls whose history predates the change.
pub const DEFAULT_VERSION: i32 = -1;

pub(crate) struct VersionMachine {
    change_id: String,
    preloaded_version: Option<i32>,
    resolved_version: Option<i32>,
    marker_absorbed: bool,
    commands_expected: usize,
    out: EffectBuffer,
}

impl VersionMachine {
    pub fn new(change_id: impl Into<String>) -> Self {
        Self {
            change_id: change_id.into(),
            preloaded_version: None,
            resolved_version: None,
            marker_absorbed: false,
            commands_expected: 0,
            out: EffectBuffer::default(),
        }
    }

    /// Offer a marker event seen while scanning a batch, before dispatch.
    pub fn handle_markers_preload(&mut self, event: &HistoryEvent) {
        if self.preloaded_version.is_none() {
            self.preloaded_version = markers::version_marker_version(event);
        }
    }

    /// One `get_version` call from workflow code.
    pub fn get_version(
        &mut self,
        min_supported: i32,
        max_supported: i32,
        replaying: bool,
        callback: VersionCallback,
    ) {
        if self.resolved_version.is_none() {
            let version = if !replaying {
                self.emit_marker_command(max_supported);
                max_supported
            } else if let Some(preloaded) = self.preloaded_version {
                // The recorded marker event will arrive and must consume the
                // speculative command, unless it was already absorbed.
                if !self.marker_absorbed {
                    self.emit_marker_command(preloaded);
                }
                preloaded
            } else {
                DEFAULT_VERSION
            };
            self.resolved_version = Some(version);
        }

        let version = self.resolved_version.unwrap_or(DEFAULT_VERSION);
        let change_id = self.change_id.clone();
        let result = if version < min_supported || version > max_supported {
            Err(Failure::application(
                "unsupported-version",
                format!(
                    "version {version} of change '{change_id}' is outside the supported range \
                     [{min_supported}, {max_supported}]"
                ),
                true,
                None,
            ))
        } else {
            Ok(version)
        };
        self.out.callback(move || callback(result));
    }

    fn emit_marker_command(&mut self, version: i32) {
        self.out
            .add_command(Command::new(CommandAttributes::RecordMarker(
                markers::version_marker(&self.change_id, version),
            )));
        self.commands_expected += 1;
    }

    /// Absorb a version marker whose `get_version` call no longer exists in
    /// code. No command is consumed and no error is raised.
    pub fn handle_non_matching_event(&mut self, event: &HistoryEvent) {
        self.marker_absorbed = true;
        if self.preloaded_version.is_none() {
            self.preloaded_version = markers::version_marker_version(event);
        }
    }
}

impl EntityStateMachine for VersionMachine {
    fn name(&self) -> &'static str {
        "Version"
    }

    fn handle_event(
        &mut self,
        event: &HistoryEvent,
        _has_next: bool,
    ) -> CoreResult<HandleEventStatus> {
        let matches = markers::version_marker_change_id(event).as_deref()
            == Some(self.change_id.as_str())
            && self.commands_expected > 0;
        if !matches {
            return Ok(HandleEventStatus::NonMatching);
        }
        self.commands_expected -= 1;
        Ok(HandleEventStatus::Matched)
    }

    fn handle_command(&mut self, _command_type: CommandType) {}

    fn is_final_state(&self) -> bool {
        self.commands_expected == 0
    }

    fn take_effects(&mut self) -> MachineEffects {
        self.out.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{EventAttributes, HistoryEvent};
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Captured = Arc<Mutex<Vec<Result<i32, Failure>>>>;

    fn callback(captured: &Captured) -> VersionCallback {
        let captured = captured.clone();
        Box::new(move |r| captured.lock().push(r))
    }

    fn marker_event(change_id: &str, version: i32) -> HistoryEvent {
        HistoryEvent::new(
            6,
            Utc::now(),
            EventAttributes::MarkerRecorded(markers::version_marker(change_id, version)),
        )
    }

    fn run(machine: &mut VersionMachine) -> usize {
        let effects = machine.take_effects();
        let commands = effects.commands.len();
        for callback in effects.callbacks {
            callback();
        }
        commands
    }

    #[test]
    fn test_first_execution_records_max_supported() {
        let observed: Captured = Arc::new(Mutex::new(Vec::new()));
        let mut machine = VersionMachine::new("feature-x");
        machine.get_version(DEFAULT_VERSION, 3, false, callback(&observed));
        assert_eq!(run(&mut machine), 1);
        assert_eq!(*observed.lock(), vec![Ok(3)]);

        // Subsequent calls return the recorded value without new commands.
        machine.get_version(DEFAULT_VERSION, 5, false, callback(&observed));
        assert_eq!(run(&mut machine), 0);
        assert_eq!(observed.lock().last(), Some(&Ok(3)));
    }

    #[test]
    fn test_replay_uses_preloaded_version() {
        let observed: Captured = Arc::new(Mutex::new(Vec::new()));
        let mut machine = VersionMachine::new("feature-x");
        machine.handle_markers_preload(&marker_event("feature-x", 2));

        machine.get_version(DEFAULT_VERSION, 3, true, callback(&observed));
        assert_eq!(run(&mut machine), 1);
        assert_eq!(*observed.lock(), vec![Ok(2)]);
        assert!(!machine.is_final_state());

        let status = machine
            .handle_event(&marker_event("feature-x", 2), true)
            .unwrap();
        assert_eq!(status, HandleEventStatus::Matched);
        assert!(machine.is_final_state());
    }

    #[test]
    fn test_replay_without_marker_observes_default_version() {
        let observed: Captured = Arc::new(Mutex::new(Vec::new()));
        let mut machine = VersionMachine::new("feature-x");
        machine.get_version(DEFAULT_VERSION, 3, true, callback(&observed));
        assert_eq!(run(&mut machine), 0);
        assert_eq!(*observed.lock(), vec![Ok(DEFAULT_VERSION)]);
    }

    #[test]
    fn test_version_outside_supported_range_fails() {
        let observed: Captured = Arc::new(Mutex::new(Vec::new()));
        let mut machine = VersionMachine::new("feature-x");
        machine.handle_markers_preload(&marker_event("feature-x", 1));
        machine.get_version(2, 3, true, callback(&observed));
        run(&mut machine);

        let guard = observed.lock();
        let failure = guard[0].as_ref().unwrap_err();
        assert!(failure.is_non_retryable());
        assert!(failure.message.contains("outside the supported range"));
    }

    #[test]
    fn test_absorbed_marker_suppresses_speculative_command() {
        let observed: Captured = Arc::new(Mutex::new(Vec::new()));
        let mut machine = VersionMachine::new("feature-x");
        machine.handle_markers_preload(&marker_event("feature-x", 2));
        machine.handle_non_matching_event(&marker_event("feature-x", 2));

        machine.get_version(DEFAULT_VERSION, 3, true, callback(&observed));
        assert_eq!(run(&mut machine), 0);
        assert_eq!(*observed.lock(), vec![Ok(2)]);
        assert!(machine.is_final_state());
    }
}
