//! Retry executor with fixed or exponential backoff

use crate::callbacks::{EventSinks, RetryEvent};
use crate::classifier::{FailureClassifier, FailureContext};
use crate::clock::{Clock, MonotonicClock};
use crate::errors::{ConfigError, ResilienceError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Delay between attempts, before jitter
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Backoff {
    Fixed(Duration),
    /// `initial * multiplier^(retry - 1)`, capped at `max`
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(Duration::from_millis(500))
    }
}

impl Backoff {
    /// Delay before retry number `retry` (1 = the wait after the first failure)
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                if secs.is_finite() && secs < max.as_secs_f64() {
                    Duration::try_from_secs_f64(secs).unwrap_or(max)
                } else {
                    max
                }
            }
        }
    }
}

/// Resolution of the jitter fraction drawn from chrono-machines
const JITTER_SCALE: u64 = 1_000_000;

/// Apply chrono-machines jitter to `delay`
///
/// With factor `j` the result lies in `delay * (1 - j) ..= delay`. The policy
/// draws a fraction of `JITTER_SCALE` which then scales the full-precision
/// delay, so sub-millisecond delays keep their length.
pub(crate) fn jittered(delay: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || delay.is_zero() {
        return delay;
    }

    let policy = chrono_machines::Policy {
        max_attempts: 1,
        base_delay_ms: JITTER_SCALE,
        multiplier: 1.0,
        max_delay_ms: JITTER_SCALE,
    };
    let fraction = policy.calculate_delay(1, jitter_factor).min(JITTER_SCALE) as f64
        / JITTER_SCALE as f64;
    delay.mul_f64(fraction)
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryConfig {
    /// Attempts in total, the first call included
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Jitter factor for backoff delays (0.0 = no jitter, 1.0 = full jitter)
    pub jitter_factor: f64,
    /// Retry after the circuit breaker rejected an attempt. Off by default:
    /// hammering an open circuit only prolongs the outage.
    pub retry_on_rejection: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            jitter_factor: 0.0,
            retry_on_rejection: false,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "max_attempts",
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::FactorOutOfRange {
                field: "jitter_factor",
                value: self.jitter_factor,
            });
        }
        if let Backoff::Exponential { multiplier, .. } = self.backoff {
            if multiplier.is_nan() || multiplier < 1.0 {
                return Err(ConfigError::TooSmall {
                    field: "multiplier",
                    min: 1.0,
                    value: multiplier,
                });
            }
        }
        Ok(())
    }
}

/// Call counts by how they ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryMetrics {
    pub succeeded_without_retry: u64,
    pub succeeded_with_retry: u64,
    pub failed_without_retry: u64,
    pub failed_with_retry: u64,
}

#[derive(Debug, Default)]
struct Counters {
    succeeded_without_retry: AtomicU64,
    succeeded_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

/// Re-invokes failed attempts according to a [`RetryConfig`]
#[derive(Debug)]
pub struct Retry {
    name: String,
    config: RetryConfig,
    clock: Arc<dyn Clock>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    sinks: EventSinks,
    counters: Counters,
}

impl Retry {
    /// # Panics
    ///
    /// Panics if `config` fails [`RetryConfig::validate`].
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self::with_clock(name, config, Arc::new(MonotonicClock::new()))
    }

    /// # Panics
    ///
    /// Panics if `config` fails [`RetryConfig::validate`].
    pub fn with_clock(
        name: impl Into<String>,
        config: RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        if let Err(e) = config.validate() {
            panic!("Invalid retry configuration: {}", e);
        }
        Self {
            name: name.into(),
            config,
            clock,
            failure_classifier: None,
            sinks: EventSinks::new(),
            counters: Counters::default(),
        }
    }

    /// Only retry operation errors the classifier accepts
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    pub fn with_sinks(mut self, sinks: EventSinks) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            succeeded_without_retry: self.counters.succeeded_without_retry.load(Ordering::Relaxed),
            succeeded_with_retry: self.counters.succeeded_with_retry.load(Ordering::Relaxed),
            failed_without_retry: self.counters.failed_without_retry.load(Ordering::Relaxed),
            failed_with_retry: self.counters.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    /// Retry a plain fallible operation
    pub fn call<T, E, F>(&self, mut f: F) -> Result<T, ResilienceError<E>>
    where
        E: 'static,
        F: FnMut() -> Result<T, E>,
    {
        self.execute(|_| f().map_err(ResilienceError::OperationFailed))
    }

    /// Run `attempt` until it succeeds, fails terminally, or attempts run out
    ///
    /// The closure receives the 1-based attempt number. Exhaustion is
    /// reported as `RetriesExhausted` wrapping the last error; a
    /// non-retryable error is returned as it is.
    pub fn execute<T, E, F>(&self, mut attempt: F) -> Result<T, ResilienceError<E>>
    where
        E: 'static,
        F: FnMut(u32) -> Result<T, ResilienceError<E>>,
    {
        let mut attempt_number = 1;
        loop {
            let start = self.clock.now();
            let error = match attempt(attempt_number) {
                Ok(value) => {
                    let counter = if attempt_number == 1 {
                        &self.counters.succeeded_without_retry
                    } else {
                        &self.counters.succeeded_with_retry
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(error) => error,
            };
            let elapsed = self.clock.now().saturating_sub(start);

            if !self.is_retryable(&error, attempt_number, elapsed) {
                self.count_failure(attempt_number);
                return Err(error);
            }

            if attempt_number >= self.config.max_attempts {
                self.count_failure(attempt_number);
                tracing::event!(
                    name: "resilience.retry.exhausted",
                    tracing::Level::ERROR,
                    retry.name = %self.name,
                    retry.attempts = attempt_number,
                    retry.error = error.kind().as_str(),
                );
                self.emit(attempt_number, true, Duration::ZERO);
                return Err(ResilienceError::RetriesExhausted {
                    attempts: attempt_number,
                    last: Box::new(error),
                });
            }

            let wait = jittered(
                self.config.backoff.delay(attempt_number),
                self.config.jitter_factor,
            );
            tracing::event!(
                name: "resilience.retry",
                tracing::Level::WARN,
                retry.name = %self.name,
                retry.attempt = attempt_number,
                retry.delay = wait.as_secs_f32(),
                retry.error = error.kind().as_str(),
            );
            self.emit(attempt_number, false, wait);

            self.clock.sleep(wait);
            attempt_number += 1;
        }
    }

    fn is_retryable<E: 'static>(
        &self,
        error: &ResilienceError<E>,
        attempt: u32,
        duration: Duration,
    ) -> bool {
        match error {
            ResilienceError::CallNotPermitted { .. } => self.config.retry_on_rejection,
            ResilienceError::BulkheadFull { .. }
            | ResilienceError::RateLimitExceeded { .. }
            | ResilienceError::OperationTimedOut { .. } => true,
            ResilienceError::OperationFailed(e) => {
                self.failure_classifier.as_ref().is_none_or(|classifier| {
                    classifier.classify(&FailureContext {
                        name: &self.name,
                        error: e as &dyn std::any::Any,
                        duration,
                        attempt,
                    })
                })
            }
            ResilienceError::RetriesExhausted { .. } => false,
        }
    }

    fn count_failure(&self, attempts: u32) {
        let counter = if attempts == 1 {
            &self.counters.failed_without_retry
        } else {
            &self.counters.failed_with_retry
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn emit(&self, attempt: u32, exhausted: bool, wait: Duration) {
        if !self.sinks.is_empty() {
            self.sinks.retry(&RetryEvent {
                timestamp: SystemTime::now(),
                name: self.name.clone(),
                attempt,
                exhausted,
                wait,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::RejectReason;
    use rstest::rstest;
    use std::cell::Cell;

    fn retry(config: RetryConfig) -> (Retry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (Retry::with_clock("test", config, clock.clone()), clock)
    }

    #[test]
    fn test_succeeds_on_last_attempt() {
        let (retry, clock) = retry(RetryConfig {
            max_attempts: 4,
            ..Default::default()
        });
        let calls = Cell::new(0u32);

        let result = retry.call(|| {
            calls.set(calls.get() + 1);
            if calls.get() < 4 { Err("transient") } else { Ok("done") }
        });

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.get(), 4);
        // Three fixed 500ms waits
        assert_eq!(clock.now(), Duration::from_millis(1500));
        assert_eq!(retry.metrics().succeeded_with_retry, 1);
    }

    #[test]
    fn test_exhaustion_wraps_last_error() {
        let (retry, _clock) = retry(RetryConfig::default());
        let calls = Cell::new(0u32);

        let result: Result<(), _> = retry.call(|| {
            calls.set(calls.get() + 1);
            Err(format!("failure {}", calls.get()))
        });

        match result {
            Err(ResilienceError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last.into_inner().as_deref(), Some("failure 3"));
            }
            other => panic!("Expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(retry.metrics().failed_with_retry, 1);
    }

    #[test]
    fn test_open_circuit_is_terminal_by_default() {
        let (retry, clock) = retry(RetryConfig::default());
        let calls = Cell::new(0u32);

        let result: Result<(), ResilienceError<String>> = retry.execute(|_| {
            calls.set(calls.get() + 1);
            Err(ResilienceError::CallNotPermitted {
                circuit: "svc".to_string(),
                reason: RejectReason::Open,
            })
        });

        assert!(matches!(result, Err(ResilienceError::CallNotPermitted { .. })));
        assert_eq!(calls.get(), 1);
        assert_eq!(clock.now(), Duration::ZERO);
        assert_eq!(retry.metrics().failed_without_retry, 1);
    }

    #[test]
    fn test_open_circuit_retried_when_enabled() {
        let (retry, _clock) = retry(RetryConfig {
            retry_on_rejection: true,
            ..Default::default()
        });
        let calls = Cell::new(0u32);

        let result: Result<(), ResilienceError<String>> = retry.execute(|_| {
            calls.set(calls.get() + 1);
            Err(ResilienceError::CallNotPermitted {
                circuit: "svc".to_string(),
                reason: RejectReason::Open,
            })
        });

        assert!(matches!(
            result,
            Err(ResilienceError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_classifier_stops_non_retryable_errors() {
        use crate::classifier::PredicateClassifier;

        let (retry, _clock) = retry(RetryConfig::default());
        let retry = retry.with_classifier(Arc::new(PredicateClassifier::new(
            |ctx: &FailureContext<'_>| {
                ctx.error
                    .downcast_ref::<&str>()
                    .is_some_and(|e| *e != "bad request")
            },
        )));
        let calls = Cell::new(0u32);

        let result: Result<(), _> = retry.call(|| {
            calls.set(calls.get() + 1);
            Err("bad request")
        });

        assert!(matches!(result, Err(ResilienceError::OperationFailed("bad request"))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_attempt_number_passed_to_operation() {
        let (retry, _clock) = retry(RetryConfig::default());
        let mut seen = Vec::new();

        let _: Result<(), ResilienceError<()>> = retry.execute(|attempt| {
            seen.push(attempt);
            Err(ResilienceError::OperationFailed(()))
        });

        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(4, 800)]
    #[case(5, 1000)]
    #[case(40, 1000)]
    fn test_exponential_backoff_is_capped(#[case] retry: u32, #[case] expected_ms: u64) {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(1),
        };

        assert_eq!(backoff.delay(retry), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..20 {
            let delay = jittered(base, 0.5);
            assert!(delay <= Duration::from_millis(1000), "got {:?}", delay);
            assert!(delay >= Duration::from_millis(500), "got {:?}", delay);
        }
        assert_eq!(jittered(base, 0.0), base);
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());

        let zero = RetryConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(
            zero.validate(),
            Err(ConfigError::Zero {
                field: "max_attempts"
            })
        );

        let shrinking = RetryConfig {
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(100),
                multiplier: 0.5,
                max: Duration::from_secs(1),
            },
            ..Default::default()
        };
        assert!(shrinking.validate().is_err());
    }

    #[test]
    #[should_panic(expected = "Invalid retry configuration")]
    fn test_negative_multiplier_is_rejected() {
        Retry::new(
            "test",
            RetryConfig {
                backoff: Backoff::Exponential {
                    initial: Duration::from_millis(100),
                    multiplier: -2.0,
                    max: Duration::from_secs(1),
                },
                ..Default::default()
            },
        );
    }

    #[test]
    #[should_panic(expected = "Invalid retry configuration")]
    fn test_jitter_factor_above_one_is_rejected() {
        Retry::new(
            "test",
            RetryConfig {
                jitter_factor: 5.0,
                ..Default::default()
            },
        );
    }

    #[test]
    fn test_jitter_keeps_sub_millisecond_delays() {
        let base = Duration::from_micros(900);
        for _ in 0..20 {
            let delay = jittered(base, 0.1);
            assert!(delay <= base, "got {:?}", delay);
            assert!(delay >= Duration::from_micros(809), "got {:?}", delay);
        }

        let precise = Duration::from_micros(1_500);
        assert!(jittered(precise, 0.1) >= Duration::from_micros(1_349));
    }
}
