//! Circuit breaker implementation using state machines
//!
//! The breaker's states and guarded transitions are declared with
//! `state_machines`. The machine lives behind a mutex that is held only while
//! a permission is decided or an outcome is recorded; the protected operation
//! always runs outside of it. Every decision (admitting a half-open trial
//! call, tripping, closing) is therefore made by exactly one caller.

use crate::{
    Outcome, OutcomeKind,
    builder::CircuitBuilder,
    callbacks::{Callbacks, ComponentKind, Decision},
    classifier::{FailureClassifier, FailureContext},
    clock::{Clock, MonotonicClock},
    errors::{ConfigError, RejectReason, Rejection, ResilienceError},
    retry::jittered,
    window::{CountWindow, SlidingWindow, TimeWindow, WindowCounts, WindowSnapshot},
};
use state_machines::state_machine;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Layout of the closed-state sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SlidingWindowType {
    /// Last `sliding_window_size` calls
    #[default]
    CountBased,
    /// Calls of the last `sliding_window_size` seconds, one bucket per second
    TimeBased,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CircuitConfig {
    /// Failure percentage (0-100) at or above which the circuit opens
    pub failure_rate_threshold: f32,

    /// Slow call percentage (0-100) at or above which the circuit opens
    pub slow_call_rate_threshold: f32,

    /// Calls taking at least this long count as slow
    pub slow_call_duration_threshold: Duration,

    pub sliding_window_type: SlidingWindowType,

    /// Calls (count-based) or seconds (time-based) covered by the window
    pub sliding_window_size: usize,

    /// Calls required before rates are evaluated
    pub minimum_number_of_calls: usize,

    /// How long the circuit stays open before trial calls are allowed
    pub wait_duration_in_open_state: Duration,

    /// Trial calls admitted in HalfOpen
    pub permitted_calls_in_half_open: usize,

    /// Move Open -> HalfOpen on the first permission check after the wait.
    /// When disabled, only `transition_to_half_open_state` leaves Open.
    pub automatic_transition_enabled: bool,

    /// Jitter factor for the open-state wait (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: wait * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            wait_duration_in_open_state: Duration::from_secs(60),
            permitted_calls_in_half_open: 10,
            automatic_transition_enabled: true,
            jitter_factor: 0.0,
        }
    }
}

impl CircuitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("failure_rate_threshold", self.failure_rate_threshold),
            ("slow_call_rate_threshold", self.slow_call_rate_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::PercentageOutOfRange { field, value });
            }
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::FactorOutOfRange {
                field: "jitter_factor",
                value: self.jitter_factor,
            });
        }
        for (field, value) in [
            ("sliding_window_size", self.sliding_window_size),
            ("minimum_number_of_calls", self.minimum_number_of_calls),
            (
                "permitted_calls_in_half_open",
                self.permitted_calls_in_half_open,
            ),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        Ok(())
    }

    /// Fresh window for one breaker generation
    pub(crate) fn build_window(&self, clock: &Arc<dyn Clock>) -> Arc<dyn SlidingWindow> {
        match self.sliding_window_type {
            SlidingWindowType::CountBased => Arc::new(CountWindow::new(
                self.sliding_window_size,
                self.minimum_number_of_calls,
            )),
            SlidingWindowType::TimeBased => Arc::new(TimeWindow::per_second(
                self.sliding_window_size,
                self.minimum_number_of_calls,
                Arc::clone(clock),
            )),
        }
    }

    /// Reason for opening, if either rate is at or above its threshold
    pub(crate) fn exceeded(&self, snapshot: &WindowSnapshot) -> Option<String> {
        if !snapshot.has_enough_calls() {
            return None;
        }

        let failure_rate = snapshot.failure_rate();
        if failure_rate >= self.failure_rate_threshold {
            return Some(format!(
                "failure rate {:.1}% >= threshold {:.1}%",
                failure_rate, self.failure_rate_threshold
            ));
        }

        let slow_call_rate = snapshot.slow_call_rate();
        if slow_call_rate >= self.slow_call_rate_threshold {
            return Some(format!(
                "slow call rate {:.1}% >= threshold {:.1}%",
                slow_call_rate, self.slow_call_rate_threshold
            ));
        }

        None
    }
}

/// Public view of the breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
    Disabled,
    ForcedOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
            CircuitState::Disabled => "Disabled",
            CircuitState::ForcedOpen => "ForcedOpen",
        }
    }

    fn from_machine(name: &str) -> Self {
        match name {
            "Open" => CircuitState::Open,
            "HalfOpen" => CircuitState::HalfOpen,
            "Disabled" => CircuitState::Disabled,
            "ForcedOpen" => CircuitState::ForcedOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time breaker statistics
///
/// In HalfOpen the figures cover the current trial calls only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub failure_rate: f32,
    pub slow_call_rate: f32,
    pub buffered_calls: usize,
    pub failed_calls: usize,
    pub slow_calls: usize,
    pub not_permitted_calls: u64,
}

/// Context provided to fallback closures when a call is rejected
#[derive(Debug, Clone)]
pub struct FallbackContext {
    /// Circuit name
    pub circuit_name: String,
    /// Circuit state at rejection time
    pub state: CircuitState,
    pub reason: RejectReason,
}

/// Type alias for fallback function
pub type FallbackFn<T, E> = Box<dyn FnOnce(&FallbackContext) -> Result<T, E> + Send>;

/// Options for circuit breaker calls
pub struct CallOptions<T, E> {
    /// Optional fallback function called when the circuit rejects the call
    pub fallback: Option<FallbackFn<T, E>>,
}

impl<T, E> Default for CallOptions<T, E> {
    fn default() -> Self {
        Self { fallback: None }
    }
}

impl<T, E> CallOptions<T, E> {
    /// Create new call options with no fallback
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a fallback function
    pub fn with_fallback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&FallbackContext) -> Result<T, E> + Send + 'static,
    {
        self.fallback = Some(Box::new(f));
        self
    }
}

/// Type alias for callable function
pub type CallableFn<T, E> = Box<dyn FnOnce() -> Result<T, E>>;

/// Trait for converting into CallOptions - allows flexible call() API
pub trait IntoCallOptions<T, E> {
    fn into_call_options(self) -> (CallableFn<T, E>, CallOptions<T, E>);
}

/// Implement for plain closures
impl<T, E, F> IntoCallOptions<T, E> for F
where
    F: FnOnce() -> Result<T, E> + 'static,
{
    fn into_call_options(self) -> (CallableFn<T, E>, CallOptions<T, E>) {
        (Box::new(self), CallOptions::default())
    }
}

/// Implement for (closure, CallOptions) tuple
impl<T, E, F> IntoCallOptions<T, E> for (F, CallOptions<T, E>)
where
    F: FnOnce() -> Result<T, E> + 'static,
{
    fn into_call_options(self) -> (CallableFn<T, E>, CallOptions<T, E>) {
        (Box::new(self.0), self.1)
    }
}

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    pub config: CircuitConfig,
    pub window: Arc<dyn SlidingWindow>,
    pub clock: Arc<dyn Clock>,
}

impl CircuitContext {
    pub(crate) fn new(name: String, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        let window = config.build_window(&clock);
        Self {
            name,
            config,
            window,
            clock,
        }
    }
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self::new(
            String::new(),
            CircuitConfig::default(),
            Arc::new(MonotonicClock::new()),
        )
    }
}

impl std::fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("window", &self.window)
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: Duration,
    /// Wait before trial calls, jitter already applied
    pub wait: Duration,
}

/// Data specific to the HalfOpen state: the trial window
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    /// Trial permits handed out
    pub issued: usize,
    /// Outcomes of finished trial calls
    pub counts: WindowCounts,
}

impl HalfOpenData {
    fn snapshot(&self, ctx: &CircuitContext) -> WindowSnapshot {
        WindowSnapshot::new(self.counts, ctx.config.permitted_calls_in_half_open)
    }
}

// Define the circuit breaker state machine with dynamic mode
state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,  // Enable dynamic mode for runtime state transitions

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
        Disabled,
        ForcedOpen,
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        force_trip {
            transition: { from: [Closed, HalfOpen, Disabled, ForcedOpen], to: Open }
        }
        attempt_reset {
            guards: [wait_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        probe {
            transition: { from: [Closed, Open, Disabled, ForcedOpen], to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
        force_open {
            transition: { from: [Closed, Open, HalfOpen, Disabled], to: ForcedOpen }
        }
        disable {
            transition: { from: [Closed, Open, HalfOpen, ForcedOpen], to: Disabled }
        }
    }
}

// Guards for dynamic mode - implemented on typestate machines
impl Circuit<Closed> {
    /// Check if the window's failure or slow call rate reached its threshold
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        ctx.config.exceeded(&ctx.window.snapshot()).is_some()
    }
}

impl Circuit<HalfOpen> {
    /// Every trial call finished and the trial rates are over threshold
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        self.state_data_half_open().is_some_and(|data| {
            let snapshot = data.snapshot(ctx);
            snapshot.has_enough_calls() && ctx.config.exceeded(&snapshot).is_some()
        })
    }

    /// Every trial call finished and the trial rates are within thresholds
    fn should_close(&self, ctx: &CircuitContext) -> bool {
        self.state_data_half_open().is_some_and(|data| {
            let snapshot = data.snapshot(ctx);
            snapshot.has_enough_calls() && ctx.config.exceeded(&snapshot).is_none()
        })
    }
}

impl Circuit<Open> {
    /// Check if the wait has elapsed for Open -> HalfOpen transition
    fn wait_elapsed(&self, ctx: &CircuitContext) -> bool {
        self.state_data_open()
            .is_some_and(|data| ctx.clock.now().saturating_sub(data.opened_at) >= data.wait)
    }
}

/// A state change decided under the lock, announced after it is released
struct Transition {
    from: CircuitState,
    to: CircuitState,
    reason: String,
}

/// How an admitted call ended
#[derive(Debug, Clone, Copy)]
enum Completion {
    Success(Duration),
    Failure(Duration),
    /// Classifier excluded the error, nothing is recorded
    Ignored,
}

/// Identity of an admission: outcomes from other generations or epochs are stale
#[derive(Debug, Clone, Copy)]
struct Ticket {
    generation: u64,
    epoch: u64,
    state: CircuitState,
}

struct Core {
    machine: DynamicCircuit,
    context: CircuitContext,
    /// Bumped on reconfiguration
    generation: u64,
    /// Bumped on every state change
    epoch: u64,
}

impl Core {
    fn state(&self) -> CircuitState {
        CircuitState::from_machine(self.machine.current_state())
    }

    fn restart(&mut self) {
        self.context.window.reset();
        self.machine = DynamicCircuit::new(self.context.clone());
        self.epoch += 1;
    }

    /// Apply Open-state bookkeeping (timestamp, jittered wait, fresh window)
    fn mark_open(&mut self) {
        let wait = jittered(
            self.context.config.wait_duration_in_open_state,
            self.context.config.jitter_factor,
        );
        let now = self.context.clock.now();
        if let Some(data) = self.machine.open_data_mut() {
            data.opened_at = now;
            data.wait = wait;
        }
        self.context.window.reset();
        self.epoch += 1;
    }

    fn try_trip(&mut self, from: CircuitState) -> Option<Transition> {
        let reason = match from {
            CircuitState::HalfOpen => {
                let snapshot = self.machine.half_open_data()?.snapshot(&self.context);
                self.context
                    .config
                    .exceeded(&snapshot)
                    .map(|reason| format!("trial calls: {}", reason))
            }
            _ => self.context.config.exceeded(&self.context.window.snapshot()),
        }?;

        if self.machine.handle(CircuitEvent::Trip).is_ok() {
            self.mark_open();
            Some(Transition {
                from,
                to: CircuitState::Open,
                reason,
            })
        } else {
            None
        }
    }

    fn try_close(&mut self) -> Option<Transition> {
        if self.machine.handle(CircuitEvent::Close).is_ok() {
            self.context.window.reset();
            self.epoch += 1;
            Some(Transition {
                from: CircuitState::HalfOpen,
                to: CircuitState::Closed,
                reason: "trial calls within thresholds".to_string(),
            })
        } else {
            None
        }
    }
}

/// Outcome of a permission check
#[derive(Debug)]
pub enum Permission<'a> {
    Permitted(CallPermit<'a>),
    Rejected(RejectReason),
}

/// Circuit breaker public API
pub struct CircuitBreaker {
    name: String,
    core: Mutex<Core>,
    clock: Arc<dyn Clock>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
    not_permitted: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker (use builder() for more options)
    ///
    /// # Panics
    ///
    /// Panics if `config` does not validate.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        CircuitBuilder::new(name).config(config).build()
    }

    /// Create a circuit breaker from validated parts (used by builder)
    pub(crate) fn from_parts(
        name: String,
        config: CircuitConfig,
        clock: Arc<dyn Clock>,
        failure_classifier: Option<Arc<dyn FailureClassifier>>,
        callbacks: Callbacks,
    ) -> Self {
        let context = CircuitContext::new(name.clone(), config, Arc::clone(&clock));
        let machine = DynamicCircuit::new(context.clone());

        Self {
            name,
            core: Mutex::new(Core {
                machine,
                context,
                generation: 0,
                epoch: 0,
            }),
            clock,
            failure_classifier,
            callbacks,
            not_permitted: AtomicU64::new(0),
        }
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> CircuitBuilder {
        CircuitBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the active configuration
    pub fn config(&self) -> CircuitConfig {
        self.lock().context.config.clone()
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce(&self, transition: Option<Transition>) {
        if let Some(t) = transition {
            self.callbacks
                .trigger_transition(&self.name, t.from, t.to, &t.reason);
        }
    }

    /// Decide whether a call may proceed
    ///
    /// Never blocks. An elapsed Open wait moves the circuit to HalfOpen here
    /// when automatic transition is enabled.
    pub fn check_permission(&self) -> Permission<'_> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let mut transition = None;

        if core.state() == CircuitState::Open
            && core.context.config.automatic_transition_enabled
            && core.machine.handle(CircuitEvent::AttemptReset).is_ok()
        {
            core.epoch += 1;
            transition = Some(Transition {
                from: CircuitState::Open,
                to: CircuitState::HalfOpen,
                reason: "wait duration in open state elapsed".to_string(),
            });
        }

        let state = core.state();
        let decision = match state {
            CircuitState::Closed | CircuitState::Disabled => Ok(()),
            CircuitState::Open => Err(RejectReason::Open),
            CircuitState::ForcedOpen => Err(RejectReason::ForcedOpen),
            CircuitState::HalfOpen => {
                let quota = core.context.config.permitted_calls_in_half_open;
                match core.machine.half_open_data_mut() {
                    Some(data) if data.issued < quota => {
                        data.issued += 1;
                        Ok(())
                    }
                    _ => Err(RejectReason::HalfOpenLimitReached),
                }
            }
        };
        let ticket = Ticket {
            generation: core.generation,
            epoch: core.epoch,
            state,
        };
        drop(guard);

        self.announce(transition);

        match decision {
            Ok(()) => {
                self.callbacks.sinks.admission(
                    ComponentKind::CircuitBreaker,
                    &self.name,
                    Decision::Permitted,
                    None,
                );
                Permission::Permitted(CallPermit {
                    breaker: self,
                    ticket,
                    completed: false,
                })
            }
            Err(reason) => {
                self.not_permitted.fetch_add(1, Ordering::Relaxed);
                tracing::event!(
                    name: "resilience.circuit_breaker.rejected",
                    tracing::Level::WARN,
                    circuit_breaker.name = %self.name,
                    circuit_breaker.state = state.as_str(),
                    circuit_breaker.reason = reason.as_str(),
                );
                self.callbacks.sinks.admission(
                    ComponentKind::CircuitBreaker,
                    &self.name,
                    Decision::Rejected,
                    Some(reason.to_string()),
                );
                Permission::Rejected(reason)
            }
        }
    }

    /// [`check_permission`](Self::check_permission) as a `Result`
    pub fn try_acquire_permission(&self) -> Result<CallPermit<'_>, Rejection> {
        match self.check_permission() {
            Permission::Permitted(permit) => Ok(permit),
            Permission::Rejected(reason) => Err(Rejection::CallNotPermitted {
                circuit: self.name.clone(),
                reason,
            }),
        }
    }

    fn complete(&self, ticket: Ticket, completion: Completion) {
        let mut guard = self.lock();
        let core = &mut *guard;

        if ticket.generation != core.generation || ticket.epoch != core.epoch {
            tracing::event!(
                name: "resilience.circuit_breaker.stale_outcome",
                tracing::Level::DEBUG,
                circuit_breaker.name = %self.name,
                circuit_breaker.admitted_in = ticket.state.as_str(),
            );
            return;
        }

        let slow_threshold = core.context.config.slow_call_duration_threshold;
        let outcome = match completion {
            Completion::Success(duration) => Some(Outcome::new(
                OutcomeKind::classify(false, duration >= slow_threshold),
                duration,
                self.clock.now(),
            )),
            Completion::Failure(duration) => Some(Outcome::new(
                OutcomeKind::classify(true, duration >= slow_threshold),
                duration,
                self.clock.now(),
            )),
            Completion::Ignored => None,
        };

        let transition = match core.state() {
            CircuitState::Closed => outcome.and_then(|outcome| {
                core.context.window.record(&outcome);
                core.try_trip(CircuitState::Closed)
            }),
            CircuitState::HalfOpen => {
                if let Some(data) = core.machine.half_open_data_mut() {
                    match outcome {
                        Some(outcome) => data.counts.add(outcome.kind),
                        // Hand the trial slot back to the next caller
                        None => data.issued = data.issued.saturating_sub(1),
                    }
                }
                core.try_trip(CircuitState::HalfOpen)
                    .or_else(|| core.try_close())
            }
            // Disabled records nothing; Open and ForcedOpen never admit
            _ => None,
        };
        drop(guard);

        self.announce(transition);
    }

    /// Execute a fallible operation with circuit breaker protection
    ///
    /// Accepts either:
    /// - A plain closure: `circuit.call(|| api_request())`
    /// - A closure with options: `circuit.call((|| api_request(), CallOptions::new().with_fallback(...)))`
    pub fn call<I, T, E: 'static>(&self, input: I) -> Result<T, ResilienceError<E>>
    where
        I: IntoCallOptions<T, E>,
    {
        let (f, options) = input.into_call_options();

        let permit = match self.check_permission() {
            Permission::Permitted(permit) => permit,
            Permission::Rejected(reason) => {
                // If fallback is provided, use it instead of returning error
                if let Some(fallback) = options.fallback {
                    let ctx = FallbackContext {
                        circuit_name: self.name.clone(),
                        state: self.state(),
                        reason,
                    };
                    return fallback(&ctx).map_err(ResilienceError::OperationFailed);
                }

                return Err(ResilienceError::CallNotPermitted {
                    circuit: self.name.clone(),
                    reason,
                });
            }
        };

        let start = self.clock.now();
        match f() {
            Ok(val) => {
                permit.on_success(self.clock.now().saturating_sub(start));
                Ok(val)
            }
            Err(e) => {
                permit.on_error(self.clock.now().saturating_sub(start), &e);
                Err(ResilienceError::OperationFailed(e))
            }
        }
    }

    /// Current state; never causes a transition
    pub fn state(&self) -> CircuitState {
        self.lock().state()
    }

    /// Get current state name
    pub fn state_name(&self) -> &'static str {
        self.state().as_str()
    }

    /// Check if circuit is open
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Check if circuit is closed
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let core = self.lock();
        let state = core.state();
        let snapshot = match (state, core.machine.half_open_data()) {
            (CircuitState::HalfOpen, Some(data)) => data.snapshot(&core.context),
            _ => core.context.window.snapshot(),
        };

        CircuitMetrics {
            state,
            failure_rate: snapshot.failure_rate(),
            slow_call_rate: snapshot.slow_call_rate(),
            buffered_calls: snapshot.total_calls,
            failed_calls: snapshot.failed_calls,
            slow_calls: snapshot.slow_calls,
            not_permitted_calls: self.not_permitted.load(Ordering::Relaxed),
        }
    }

    fn manual_transition(
        &self,
        reason: &str,
        apply: impl FnOnce(&mut Core) -> bool,
    ) -> bool {
        let mut guard = self.lock();
        let from = guard.state();
        let changed = apply(&mut *guard);
        let to = guard.state();
        drop(guard);

        if changed {
            self.announce(Some(Transition {
                from,
                to,
                reason: reason.to_string(),
            }));
        }
        changed
    }

    /// Close the circuit with a fresh window
    pub fn transition_to_closed_state(&self) -> bool {
        self.manual_transition("manual transition", |core| {
            let was_closed = core.state() == CircuitState::Closed;
            core.restart();
            !was_closed
        })
    }

    /// Open the circuit as if it had tripped; the open-state wait applies
    pub fn transition_to_open_state(&self) -> bool {
        self.manual_transition("manual transition", |core| {
            if core.machine.handle(CircuitEvent::ForceTrip).is_ok() {
                core.mark_open();
                true
            } else {
                false
            }
        })
    }

    /// Start a trial period now (required to leave Open when automatic
    /// transition is disabled)
    pub fn transition_to_half_open_state(&self) -> bool {
        self.manual_transition("manual transition", |core| {
            if core.machine.handle(CircuitEvent::Probe).is_ok() {
                core.epoch += 1;
                true
            } else {
                false
            }
        })
    }

    /// Admit every call and stop evaluating outcomes
    pub fn transition_to_disabled_state(&self) -> bool {
        self.manual_transition("manual transition", |core| {
            if core.machine.handle(CircuitEvent::Disable).is_ok() {
                core.epoch += 1;
                true
            } else {
                false
            }
        })
    }

    /// Reject every call until another manual transition
    pub fn transition_to_forced_open_state(&self) -> bool {
        self.manual_transition("manual transition", |core| {
            if core.machine.handle(CircuitEvent::ForceOpen).is_ok() {
                core.epoch += 1;
                true
            } else {
                false
            }
        })
    }

    /// Clear all outcomes and reset circuit to Closed state
    pub fn reset(&self) {
        self.not_permitted.store(0, Ordering::Relaxed);
        self.manual_transition("reset", |core| {
            let was_closed = core.state() == CircuitState::Closed;
            core.restart();
            !was_closed
        });
    }

    /// Swap in a new configuration and a fresh window
    ///
    /// Outcomes of calls admitted under the old configuration are discarded.
    /// The circuit restarts Closed unless it was Disabled or ForcedOpen, which
    /// are re-applied.
    pub fn reconfigure(&self, config: CircuitConfig) -> Result<(), ConfigError> {
        config.validate()?;

        self.manual_transition("reconfigured", move |core| {
            let from = core.state();
            core.context = CircuitContext::new(
                core.context.name.clone(),
                config,
                Arc::clone(&core.context.clock),
            );
            core.machine = DynamicCircuit::new(core.context.clone());
            core.generation += 1;
            core.epoch += 1;

            let override_event = match from {
                CircuitState::Disabled => Some(CircuitEvent::Disable),
                CircuitState::ForcedOpen => Some(CircuitEvent::ForceOpen),
                _ => None,
            };
            if let Some(event) = override_event {
                let _ = core.machine.handle(event);
            }
            core.state() != from
        });
        Ok(())
    }

    fn classify<E: 'static>(&self, duration: Duration, error: &E) -> Completion {
        let counts = match &self.failure_classifier {
            Some(classifier) => classifier.classify(&FailureContext {
                name: &self.name,
                error: error as &dyn std::any::Any,
                duration,
                attempt: 1,
            }),
            // No classifier - every error counts
            None => true,
        };

        if counts {
            Completion::Failure(duration)
        } else {
            Completion::Ignored
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

/// Permission for one call, to be completed with its outcome
///
/// Dropping a permit without completing it records a failure, so a trial
/// slot is never leaked by a panicking caller.
#[must_use = "a permit must be completed with the call's outcome"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    ticket: Ticket,
    completed: bool,
}

impl CallPermit<'_> {
    /// State in which the call was admitted
    pub fn state(&self) -> CircuitState {
        self.ticket.state
    }

    pub fn on_success(mut self, duration: Duration) {
        self.finish(Completion::Success(duration));
    }

    /// Record a failure regardless of the failure classifier
    pub fn on_failure(mut self, duration: Duration) {
        self.finish(Completion::Failure(duration));
    }

    /// Record an error of the protected operation, subject to the classifier
    pub fn on_error<E: 'static>(mut self, duration: Duration, error: &E) {
        let completion = self.breaker.classify(duration, error);
        self.finish(completion);
    }

    /// Give the permission back without recording an outcome
    ///
    /// In HalfOpen this re-opens the trial slot the permit held, so another
    /// caller may run a trial call before the half-open evaluation.
    pub fn release(mut self) {
        self.finish(Completion::Ignored);
    }

    fn finish(&mut self, completion: Completion) {
        self.completed = true;
        self.breaker.complete(self.ticket, completion);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.completed {
            tracing::event!(
                name: "resilience.circuit_breaker.permit_dropped",
                tracing::Level::WARN,
                circuit_breaker.name = %self.breaker.name,
            );
            self.finish(Completion::Failure(Duration::ZERO));
        }
    }
}

impl std::fmt::Debug for CallPermit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPermit")
            .field("circuit", &self.breaker.name)
            .field("state", &self.ticket.state)
            .finish()
    }
}
