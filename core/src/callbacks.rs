//! Callback and event system for guard decisions and state transitions
//!
//! Closures registered through the builder (`on_open`, `on_close`,
//! `on_half_open`) fire on breaker transitions. [`EventSink`]s receive the
//! structured events of every guard and are the hook for external metrics
//! pipelines.

use crate::circuit::CircuitState;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Which guard produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    CircuitBreaker,
    Bulkhead,
    ThreadPoolBulkhead,
    RateLimiter,
    Retry,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::CircuitBreaker => "circuit_breaker",
            ComponentKind::Bulkhead => "bulkhead",
            ComponentKind::ThreadPoolBulkhead => "thread_pool_bulkhead",
            ComponentKind::RateLimiter => "rate_limiter",
            ComponentKind::Retry => "retry",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A circuit breaker state change
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionEvent {
    pub timestamp: SystemTime,
    pub component_kind: ComponentKind,
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
}

/// Outcome of an admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Permitted,
    Rejected,
}

/// A bulkhead, rate limiter or breaker admission decision
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionEvent {
    pub timestamp: SystemTime,
    pub component_kind: ComponentKind,
    pub name: String,
    pub decision: Decision,
    pub reason: Option<String>,
}

/// A retry taking place, or a retry sequence giving up
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEvent {
    pub timestamp: SystemTime,
    pub name: String,
    pub attempt: u32,
    pub exhausted: bool,
    pub wait: std::time::Duration,
}

/// Consumer of structured guard events
///
/// All methods default to no-ops so a sink only implements what it needs.
/// Sinks run inline on the calling thread and must not block.
pub trait EventSink: Send + Sync {
    fn on_transition(&self, _event: &TransitionEvent) {}

    fn on_admission(&self, _event: &AdmissionEvent) {}

    fn on_retry(&self, _event: &RetryEvent) {}
}

/// Shared list of sinks attached to a guard
#[derive(Clone, Default)]
pub struct EventSinks {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn transition(&self, event: &TransitionEvent) {
        for sink in &self.sinks {
            sink.on_transition(event);
        }
    }

    /// Emit an admission decision. Building the event is skipped without sinks.
    pub fn admission(
        &self,
        component_kind: ComponentKind,
        name: &str,
        decision: Decision,
        reason: Option<String>,
    ) {
        if self.sinks.is_empty() {
            return;
        }
        let event = AdmissionEvent {
            timestamp: SystemTime::now(),
            component_kind,
            name: name.to_string(),
            decision,
            reason,
        };
        for sink in &self.sinks {
            sink.on_admission(&event);
        }
    }

    pub fn retry(&self, event: &RetryEvent) {
        for sink in &self.sinks {
            sink.on_retry(event);
        }
    }
}

impl fmt::Debug for EventSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSinks")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Callbacks for circuit breaker events
#[derive(Clone)]
pub struct Callbacks {
    pub on_open: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_close: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_half_open: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub sinks: EventSinks,
}

impl Callbacks {
    pub fn new() -> Self {
        Self {
            on_open: None,
            on_close: None,
            on_half_open: None,
            sinks: EventSinks::new(),
        }
    }

    /// Dispatch a transition to the matching closure, the sinks and the log
    pub fn trigger_transition(
        &self,
        circuit: &str,
        from: CircuitState,
        to: CircuitState,
        reason: &str,
    ) {
        tracing::event!(
            name: "resilience.circuit_breaker.transition",
            tracing::Level::INFO,
            circuit_breaker.name = circuit,
            circuit_breaker.from = from.as_str(),
            circuit_breaker.to = to.as_str(),
            circuit_breaker.reason = reason,
        );

        let callback = match to {
            CircuitState::Open => self.on_open.as_ref(),
            CircuitState::Closed => self.on_close.as_ref(),
            CircuitState::HalfOpen => self.on_half_open.as_ref(),
            CircuitState::Disabled | CircuitState::ForcedOpen => None,
        };
        if let Some(callback) = callback {
            callback(circuit);
        }

        if !self.sinks.is_empty() {
            self.sinks.transition(&TransitionEvent {
                timestamp: SystemTime::now(),
                component_kind: ComponentKind::CircuitBreaker,
                name: circuit.to_string(),
                from,
                to,
                reason: reason.to_string(),
            });
        }
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .field("sinks", &self.sinks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        transitions: Mutex<Vec<TransitionEvent>>,
        admissions: AtomicUsize,
    }

    impl EventSink for Recorder {
        fn on_transition(&self, event: &TransitionEvent) {
            self.transitions.lock().unwrap().push(event.clone());
        }

        fn on_admission(&self, _event: &AdmissionEvent) {
            self.admissions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_transition_reaches_callback_and_sink() {
        let opened = Arc::new(AtomicUsize::new(0));
        let opened_clone = opened.clone();
        let recorder = Arc::new(Recorder::default());

        let mut callbacks = Callbacks::new();
        callbacks.on_open = Some(Arc::new(move |_| {
            opened_clone.fetch_add(1, Ordering::SeqCst);
        }));
        callbacks.sinks.push(recorder.clone());

        callbacks.trigger_transition(
            "api",
            CircuitState::Closed,
            CircuitState::Open,
            "failure rate",
        );
        callbacks.trigger_transition(
            "api",
            CircuitState::Open,
            CircuitState::HalfOpen,
            "wait elapsed",
        );

        assert_eq!(opened.load(Ordering::SeqCst), 1);
        let transitions = recorder.transitions.lock().unwrap();
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].to, CircuitState::Open);
        assert_eq!(transitions[1].from, CircuitState::Open);
        assert_eq!(transitions[1].reason, "wait elapsed");
    }

    #[test]
    fn test_admission_without_sinks_is_noop() {
        let sinks = EventSinks::new();
        sinks.admission(ComponentKind::Bulkhead, "db", Decision::Rejected, None);
        assert!(sinks.is_empty());
    }

    #[test]
    fn test_admission_fans_out() {
        let recorder = Arc::new(Recorder::default());
        let mut sinks = EventSinks::new();
        sinks.push(recorder.clone());
        sinks.push(recorder.clone());

        sinks.admission(ComponentKind::RateLimiter, "api", Decision::Permitted, None);

        assert_eq!(sinks.len(), 2);
        assert_eq!(recorder.admissions.load(Ordering::SeqCst), 2);
    }
}
