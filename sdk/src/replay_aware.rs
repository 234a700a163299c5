//! Replay-aware metrics.
//!
//! Workflow code runs many times over the same logical execution; metrics
//! emitted while replaying history would be counted once per replay. The
//! replay-aware scope drops all recordings while the owning execution is
//! replaying and delegates otherwise. Timers measure with an injected clock
//! so that workflow time, not wall-clock, drives durations.

use std::sync::Arc;
use std::time::Duration;

/// Minimal metrics recording surface the SDK emits into. Adapters to real
/// backends implement this trait.
pub trait MetricsScope: Send + Sync {
    fn counter(&self, name: &str, delta: u64);
    fn gauge(&self, name: &str, value: f64);
    fn timer(&self, name: &str, duration: Duration);
}

/// Scope that drops every recording.
#[derive(Default)]
pub struct NoopMetricsScope;

impl MetricsScope for NoopMetricsScope {
    fn counter(&self, _name: &str, _delta: u64) {}
    fn gauge(&self, _name: &str, _value: f64) {}
    fn timer(&self, _name: &str, _duration: Duration) {}
}

type ReplayFlag = Arc<dyn Fn() -> bool + Send + Sync>;
type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Wraps a scope and suppresses emission during replay.
#[derive(Clone)]
pub struct ReplayAwareScope {
    scope: Arc<dyn MetricsScope>,
    replaying: ReplayFlag,
    clock: Clock,
}

impl ReplayAwareScope {
    pub fn new(scope: Arc<dyn MetricsScope>, replaying: ReplayFlag, clock: Clock) -> Self {
        Self {
            scope,
            replaying,
            clock,
        }
    }

    fn suppressed(&self) -> bool {
        (self.replaying)()
    }

    /// Start measuring; [`ScopeTimer::stop`] records the elapsed time via
    /// the injected clock unless the execution is replaying at stop time.
    pub fn start_timer(&self, name: impl Into<String>) -> ScopeTimer {
        ScopeTimer {
            scope: self.clone(),
            name: name.into(),
            started_at_millis: (self.clock)(),
        }
    }
}

impl MetricsScope for ReplayAwareScope {
    fn counter(&self, name: &str, delta: u64) {
        if !self.suppressed() {
            self.scope.counter(name, delta);
        }
    }

    fn gauge(&self, name: &str, value: f64) {
        if !self.suppressed() {
            self.scope.gauge(name, value);
        }
    }

    fn timer(&self, name: &str, duration: Duration) {
        if !self.suppressed() {
            self.scope.timer(name, duration);
        }
    }
}

/// In-flight timer measurement.
pub struct ScopeTimer {
    scope: ReplayAwareScope,
    name: String,
    started_at_millis: i64,
}

impl ScopeTimer {
    pub fn stop(self) {
        let elapsed = ((self.scope.clock)() - self.started_at_millis).max(0);
        self.scope
            .timer(&self.name, Duration::from_millis(elapsed as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    #[derive(Default)]
    struct RecordingScope {
        counters: Mutex<Vec<(String, u64)>>,
        gauges: Mutex<Vec<(String, f64)>>,
        timers: Mutex<Vec<(String, Duration)>>,
    }

    impl MetricsScope for RecordingScope {
        fn counter(&self, name: &str, delta: u64) {
            self.counters.lock().push((name.to_string(), delta));
        }
        fn gauge(&self, name: &str, value: f64) {
            self.gauges.lock().push((name.to_string(), value));
        }
        fn timer(&self, name: &str, duration: Duration) {
            self.timers.lock().push((name.to_string(), duration));
        }
    }

    fn scope_with(replaying: bool) -> (Arc<RecordingScope>, ReplayAwareScope) {
        let recording = Arc::new(RecordingScope::default());
        let flag = Arc::new(AtomicBool::new(replaying));
        let scope = ReplayAwareScope::new(
            recording.clone(),
            Arc::new(move || flag.load(Ordering::SeqCst)),
            Arc::new(|| 0),
        );
        (recording, scope)
    }

    #[test]
    fn test_replaying_suppresses_all_recordings() {
        let (recording, scope) = scope_with(true);
        scope.counter("test-counter", 1);
        scope.gauge("test-gauge", 100.0);
        scope.timer("test-timer", Duration::from_millis(100));

        assert!(recording.counters.lock().is_empty());
        assert!(recording.gauges.lock().is_empty());
        assert!(recording.timers.lock().is_empty());
    }

    #[test]
    fn test_not_replaying_delegates() {
        let (recording, scope) = scope_with(false);
        scope.counter("test-counter", 1);
        scope.gauge("test-gauge", 100.0);
        scope.timer("test-timer", Duration::from_millis(100));

        assert_eq!(
            *recording.counters.lock(),
            vec![("test-counter".to_string(), 1)]
        );
        assert_eq!(recording.gauges.lock().len(), 1);
        assert_eq!(recording.timers.lock().len(), 1);
    }

    #[test]
    fn test_timer_uses_injected_clock() {
        let recording = Arc::new(RecordingScope::default());
        let now = Arc::new(AtomicI64::new(10_000));
        let clock_now = now.clone();
        let scope = ReplayAwareScope::new(
            recording.clone(),
            Arc::new(|| false),
            Arc::new(move || clock_now.load(Ordering::SeqCst)),
        );

        let timer = scope.start_timer("elapsed");
        now.store(10_250, Ordering::SeqCst);
        timer.stop();

        assert_eq!(
            *recording.timers.lock(),
            vec![("elapsed".to_string(), Duration::from_millis(250))]
        );
    }
}
