//! Generic finite-state-machine definition shared by all entity machines.
//!
//! A definition is built once per machine type and shared by every instance:
//! an initial state, one or more final states, and transitions of the form
//! `(state, trigger) -> new state [, action]`. Triggers are either a command
//! type (the "command prepared" notification), a history event type, or an
//! explicit event local to the owning machine. Registering the same
//! `(state, trigger)` pair twice is a programmer error and panics at
//! definition-build time.

use crate::command::CommandType;
use crate::error::{CoreError, CoreResult};
use crate::history::EventType;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// What caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Trigger<E> {
    Command(CommandType),
    Event(EventType),
    Explicit(E),
}

/// One observed transition, reported to the state-machine sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub machine: &'static str,
    pub from: String,
    pub to: String,
    pub trigger: String,
}

/// Observer for machine transitions, used by tests and telemetry.
pub type StateMachineSink = Arc<dyn Fn(&TransitionRecord) + Send + Sync>;

struct Target<S, D> {
    to: S,
    action: Option<fn(&mut D)>,
}

/// Shared, immutable transition table for one machine type.
pub(crate) struct StateMachineDefinition<S, E, D> {
    name: &'static str,
    initial: S,
    final_states: Vec<S>,
    transitions: HashMap<(S, Trigger<E>), Target<S, D>>,
}

impl<S, E, D> StateMachineDefinition<S, E, D>
where
    S: Copy + Eq + Hash + Debug,
    E: Copy + Eq + Hash + Debug,
{
    pub fn new(name: &'static str, initial: S, final_states: &[S]) -> Self {
        Self {
            name,
            initial,
            final_states: final_states.to_vec(),
            transitions: HashMap::new(),
        }
    }

    pub fn add(self, from: S, trigger: Trigger<E>, to: S) -> Self {
        self.register(from, trigger, to, None)
    }

    pub fn add_with(self, from: S, trigger: Trigger<E>, to: S, action: fn(&mut D)) -> Self {
        self.register(from, trigger, to, Some(action))
    }

    fn register(mut self, from: S, trigger: Trigger<E>, to: S, action: Option<fn(&mut D)>) -> Self {
        let replaced = self.transitions.insert((from, trigger), Target { to, action });
        if replaced.is_some() {
            panic!(
                "duplicate transition registered for {}: {:?} on {:?}",
                self.name, from, trigger
            );
        }
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_final(&self, state: S) -> bool {
        self.final_states.contains(&state)
    }

    fn target(&self, from: S, trigger: Trigger<E>) -> Option<&Target<S, D>> {
        self.transitions.get(&(from, trigger))
    }
}

/// One machine instance: shared definition, current state and per-variant
/// data. Actions receive the data mutably and accumulate their side effects
/// there.
pub(crate) struct Machine<S: 'static, E: 'static, D: 'static> {
    definition: &'static StateMachineDefinition<S, E, D>,
    state: S,
    pub data: D,
    sink: Option<StateMachineSink>,
}

impl<S, E, D> Machine<S, E, D>
where
    S: Copy + Eq + Hash + Debug,
    E: Copy + Eq + Hash + Debug,
{
    pub fn new(
        definition: &'static StateMachineDefinition<S, E, D>,
        data: D,
        sink: Option<StateMachineSink>,
    ) -> Self {
        Self {
            definition,
            state: definition.initial,
            data,
            sink,
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn machine_name(&self) -> &'static str {
        self.definition.name
    }

    pub fn is_final(&self) -> bool {
        self.definition.is_final(self.state)
    }

    pub fn can_fire(&self, trigger: Trigger<E>) -> bool {
        self.definition.target(self.state, trigger).is_some()
    }

    pub fn fire(&mut self, trigger: Trigger<E>) -> CoreResult<()> {
        let Some(target) = self.definition.target(self.state, trigger) else {
            return Err(CoreError::IllegalState(format!(
                "{}: no transition from {:?} on {:?}",
                self.definition.name, self.state, trigger
            )));
        };
        let from = self.state;
        self.state = target.to;
        let action = target.action;
        tracing::trace!(
            machine = self.definition.name,
            from = ?from,
            to = ?self.state,
            trigger = ?trigger,
            "state transition"
        );
        if let Some(sink) = &self.sink {
            sink(&TransitionRecord {
                machine: self.definition.name,
                from: format!("{from:?}"),
                to: format!("{:?}", self.state),
                trigger: format!("{trigger:?}"),
            });
        }
        if let Some(action) = action {
            action(&mut self.data);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, OnceLock};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum State {
        Created,
        Running,
        Done,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Explicit {
        Go,
    }

    #[derive(Default)]
    struct Data {
        actions: usize,
    }

    fn definition() -> &'static StateMachineDefinition<State, Explicit, Data> {
        static DEFINITION: OnceLock<StateMachineDefinition<State, Explicit, Data>> =
            OnceLock::new();
        DEFINITION.get_or_init(|| {
            StateMachineDefinition::new("Test", State::Created, &[State::Done])
                .add_with(State::Created, Trigger::Explicit(Explicit::Go), State::Running, |d: &mut Data| {
                    d.actions += 1
                })
                .add(
                    State::Running,
                    Trigger::Event(EventType::TimerFired),
                    State::Done,
                )
        })
    }

    #[test]
    fn test_fire_transitions_and_runs_action() {
        let mut machine = Machine::new(definition(), Data::default(), None);
        assert_eq!(machine.state(), State::Created);
        assert!(!machine.is_final());

        machine.fire(Trigger::Explicit(Explicit::Go)).unwrap();
        assert_eq!(machine.state(), State::Running);
        assert_eq!(machine.data.actions, 1);

        machine
            .fire(Trigger::Event(EventType::TimerFired))
            .unwrap();
        assert!(machine.is_final());
    }

    #[test]
    fn test_fire_unregistered_trigger_is_an_error() {
        let mut machine = Machine::new(definition(), Data::default(), None);
        let error = machine
            .fire(Trigger::Event(EventType::TimerFired))
            .unwrap_err();
        assert!(error.to_string().contains("no transition"));
        assert_eq!(machine.state(), State::Created);
    }

    #[test]
    fn test_can_fire_reflects_table() {
        let machine = Machine::new(definition(), Data::default(), None);
        assert!(machine.can_fire(Trigger::Explicit(Explicit::Go)));
        assert!(!machine.can_fire(Trigger::Event(EventType::TimerFired)));
    }

    #[test]
    #[should_panic(expected = "duplicate transition")]
    fn test_duplicate_registration_panics() {
        let _ = StateMachineDefinition::<State, Explicit, Data>::new(
            "Dup",
            State::Created,
            &[State::Done],
        )
        .add(State::Created, Trigger::Explicit(Explicit::Go), State::Running)
        .add(State::Created, Trigger::Explicit(Explicit::Go), State::Done);
    }

    #[test]
    fn test_sink_observes_transitions() {
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        let records: Arc<Mutex<Vec<TransitionRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = records.clone();
        let sink: StateMachineSink = Arc::new(move |record| {
            COUNT.fetch_add(1, Ordering::SeqCst);
            captured.lock().unwrap().push(record.clone());
        });

        let mut machine = Machine::new(definition(), Data::default(), Some(sink));
        machine.fire(Trigger::Explicit(Explicit::Go)).unwrap();

        let recorded = records.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].machine, "Test");
        assert_eq!(recorded[0].from, "Created");
        assert_eq!(recorded[0].to, "Running");
    }
}
