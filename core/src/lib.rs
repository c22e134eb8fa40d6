//! ResilienceMachines - fault tolerance for calls to remote dependencies
//!
//! This crate guards calls with four cooperating primitives:
//! - Circuit breaker: sliding-window failure and slow-call rates driving a
//!   state machine (Closed → Open → HalfOpen, plus Disabled and ForcedOpen)
//! - Bulkheads: a semaphore bulkhead and a queueing thread pool bulkhead
//! - Rate limiter: fixed permissions per refresh period
//! - Retry: fixed or exponential backoff with jitter
//!
//! [`Decorators`] composes them around one operation in a fixed order, and a
//! [`Registry`] shares named instances across an application. Time is read
//! through a [`Clock`] so tests can drive every timer with [`ManualClock`].
//!
//! # Example
//!
//! ```rust
//! use resilience_machines::{CircuitBreaker, ResilienceError};
//! use std::time::Duration;
//!
//! let circuit = CircuitBreaker::builder("my_service")
//!     .failure_rate_threshold(50.0)
//!     .count_based_window(10)
//!     .minimum_number_of_calls(5)
//!     .wait_duration_in_open_state(Duration::from_secs(30))
//!     .on_open(|name| println!("Circuit {} opened!", name))
//!     .build();
//!
//! // Execute with circuit protection
//! let result = circuit.call(|| {
//!     // Your service call here
//!     Ok::<_, String>("success")
//! });
//! assert_eq!(result.unwrap(), "success");
//!
//! // Check circuit state
//! if let Err(ResilienceError::CallNotPermitted { .. }) = circuit.call(|| Ok::<_, String>("again")) {
//!     println!("Circuit is open, skipping call");
//! }
//! ```

pub mod builder;
pub mod bulkhead;
pub mod callbacks;
pub mod cancel;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod decorator;
pub mod errors;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod thread_pool;
pub mod window;

pub use builder::CircuitBuilder;
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadGuard, BulkheadMetrics};
pub use callbacks::{
    AdmissionEvent, Callbacks, ComponentKind, Decision, EventSink, EventSinks, RetryEvent,
    TransitionEvent,
};
pub use cancel::CancellationToken;
pub use circuit::{
    CallOptions, CallPermit, CircuitBreaker, CircuitConfig, CircuitMetrics, CircuitState,
    FallbackContext, Permission, SlidingWindowType,
};
pub use classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use decorator::{Decorated, Decorators};
pub use errors::{ConfigError, ErrorKind, RejectReason, Rejection, ResilienceError};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterMetrics};
pub use registry::{Registry, RegistryDefaults, RegistryError};
pub use retry::{Backoff, Retry, RetryConfig, RetryMetrics};
pub use thread_pool::{
    CallHandle, JoinError, ThreadPoolBulkhead, ThreadPoolBulkheadConfig, ThreadPoolBulkheadMetrics,
};
pub use window::{CountWindow, SlidingWindow, TimeWindow, WindowCounts, WindowSnapshot};

/// How a finished call is classified for the sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    Success,
    Failure,
    SlowSuccess,
    SlowFailure,
}

impl OutcomeKind {
    /// Combine the two independent dimensions of an outcome
    pub fn classify(failed: bool, slow: bool) -> Self {
        match (failed, slow) {
            (false, false) => OutcomeKind::Success,
            (true, false) => OutcomeKind::Failure,
            (false, true) => OutcomeKind::SlowSuccess,
            (true, true) => OutcomeKind::SlowFailure,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, OutcomeKind::Failure | OutcomeKind::SlowFailure)
    }

    pub fn is_slow(self) -> bool {
        matches!(self, OutcomeKind::SlowSuccess | OutcomeKind::SlowFailure)
    }
}

/// A single call outcome recorded by the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub kind: OutcomeKind,
    /// How long the call took
    pub duration: std::time::Duration,
    /// Clock reading when the call finished
    pub timestamp: std::time::Duration,
}

impl Outcome {
    pub fn new(
        kind: OutcomeKind,
        duration: std::time::Duration,
        timestamp: std::time::Duration,
    ) -> Self {
        Self {
            kind,
            duration,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_kind_dimensions() {
        assert_eq!(OutcomeKind::classify(false, false), OutcomeKind::Success);
        assert_eq!(OutcomeKind::classify(true, true), OutcomeKind::SlowFailure);

        assert!(OutcomeKind::SlowFailure.is_failure());
        assert!(OutcomeKind::SlowFailure.is_slow());
        assert!(!OutcomeKind::SlowSuccess.is_failure());
        assert!(!OutcomeKind::Failure.is_slow());
    }
}
