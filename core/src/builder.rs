//! Builder API for ergonomic circuit breaker configuration

use crate::{
    callbacks::{Callbacks, EventSink, EventSinks},
    circuit::{CircuitBreaker, CircuitConfig, SlidingWindowType},
    classifier::FailureClassifier,
    clock::{Clock, MonotonicClock},
    errors::ConfigError,
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating circuit breakers with fluent API
pub struct CircuitBuilder {
    name: String,
    config: CircuitConfig,
    clock: Option<Arc<dyn Clock>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: CircuitConfig::default(),
            clock: None,
            failure_classifier: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: CircuitConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the failure rate threshold in percent (0-100)
    /// Circuit opens when (failures / total_calls) * 100 >= this value
    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    /// Set the slow call rate threshold in percent (0-100)
    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    /// Calls lasting at least `threshold` count as slow
    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    /// Evaluate the last `size` calls
    pub fn count_based_window(mut self, size: usize) -> Self {
        self.config.sliding_window_type = SlidingWindowType::CountBased;
        self.config.sliding_window_size = size;
        self
    }

    /// Evaluate the calls of the last `seconds` seconds
    pub fn time_based_window(mut self, seconds: usize) -> Self {
        self.config.sliding_window_type = SlidingWindowType::TimeBased;
        self.config.sliding_window_size = seconds;
        self
    }

    /// Set minimum number of calls before rate-based thresholds are evaluated
    pub fn minimum_number_of_calls(mut self, calls: usize) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config.wait_duration_in_open_state = wait;
        self
    }

    /// Set the number of trial calls admitted in half-open
    pub fn permitted_calls_in_half_open(mut self, calls: usize) -> Self {
        self.config.permitted_calls_in_half_open = calls;
        self
    }

    /// Leave Open automatically once the wait has elapsed (default: true)
    pub fn automatic_transition(mut self, enabled: bool) -> Self {
        self.config.automatic_transition_enabled = enabled;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: wait * (1 - jitter + rand * jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor;
        self
    }

    /// Time source for durations and the open-state wait
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set a failure classifier to filter which errors should trip the circuit
    ///
    /// The classifier determines whether a given error should count toward
    /// opening the circuit. Use this to ignore "expected" errors like validation
    /// failures or client errors (4xx), while still tripping on server errors (5xx).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use resilience_machines::{CircuitBreaker, PredicateClassifier};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let circuit = CircuitBreaker::builder("api")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         // Only count slow errors
    ///         ctx.duration > Duration::from_secs(1)
    ///     })))
    ///     .build();
    /// # assert!(circuit.is_closed());
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Add a sink for transition and admission events
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.callbacks.sinks.push(sink);
        self
    }

    /// Use an existing set of sinks, e.g. one shared through a registry
    pub fn event_sinks(mut self, sinks: EventSinks) -> Self {
        self.callbacks.sinks = sinks;
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Build the circuit breaker, reporting invalid configuration
    pub fn try_build(self) -> Result<CircuitBreaker, ConfigError> {
        self.config.validate()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));

        Ok(CircuitBreaker::from_parts(
            self.name,
            self.config,
            clock,
            self.failure_classifier,
            self.callbacks,
        ))
    }

    /// Build the circuit breaker
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid; see [`try_build`](Self::try_build).
    pub fn build(self) -> CircuitBreaker {
        match self.try_build() {
            Ok(circuit) => circuit,
            Err(e) => panic!("Invalid circuit breaker configuration: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitState;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_builder_defaults() {
        let circuit = CircuitBuilder::new("test").build();

        assert_eq!(circuit.state_name(), "Closed");
        assert!(circuit.is_closed());
        assert_eq!(circuit.config(), CircuitConfig::default());
    }

    #[test]
    fn test_builder_custom_config() {
        let circuit = CircuitBuilder::new("test")
            .failure_rate_threshold(25.0)
            .time_based_window(30)
            .minimum_number_of_calls(5)
            .wait_duration_in_open_state(Duration::from_secs(5))
            .permitted_calls_in_half_open(3)
            .build();

        let config = circuit.config();
        assert_eq!(config.sliding_window_type, SlidingWindowType::TimeBased);
        assert_eq!(config.sliding_window_size, 30);
        assert_eq!(config.permitted_calls_in_half_open, 3);
    }

    #[test]
    fn test_try_build_rejects_invalid_config() {
        let result = CircuitBuilder::new("test").failure_rate_threshold(101.0).try_build();

        assert!(matches!(
            result,
            Err(ConfigError::PercentageOutOfRange {
                field: "failure_rate_threshold",
                ..
            })
        ));
    }

    #[test]
    #[should_panic(expected = "Invalid circuit breaker configuration")]
    fn test_build_panics_on_invalid_config() {
        let _ = CircuitBuilder::new("test").count_based_window(0).build();
    }

    #[test]
    fn test_builder_with_callbacks() {
        let opened = Arc::new(AtomicBool::new(false));
        let opened_clone = opened.clone();
        let half_opened = Arc::new(AtomicUsize::new(0));
        let half_opened_clone = half_opened.clone();

        let circuit = CircuitBuilder::new("test")
            .minimum_number_of_calls(2)
            .count_based_window(2)
            .on_open(move |_name| {
                opened_clone.store(true, Ordering::SeqCst);
            })
            .on_half_open(move |_name| {
                half_opened_clone.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        // Trigger failures to open circuit
        let _ = circuit.call(|| Err::<(), _>("error 1"));
        let _ = circuit.call(|| Err::<(), _>("error 2"));

        // Callback should have been triggered
        assert!(opened.load(Ordering::SeqCst));

        circuit.transition_to_half_open_state();
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        assert_eq!(half_opened.load(Ordering::SeqCst), 1);
    }
}
