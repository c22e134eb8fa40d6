//! Failure classification for error filtering
//!
//! Breakers use a classifier to decide which errors count as failures in the
//! sliding window; retries use one to decide which errors are worth another
//! attempt. Errors are handed over as `&dyn Any` so a single classifier can
//! downcast to whatever error type the protected operation returns.

use std::any::Any;
use std::time::Duration;

/// Context provided to failure classifiers for error evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Name of the breaker or retry asking
    pub name: &'a str,
    /// The error that occurred (can be downcast to specific types)
    pub error: &'a dyn Any,
    /// Duration of the failed call
    pub duration: Duration,
    /// Attempt number within a retry sequence, 1 for breakers
    pub attempt: u32,
}

/// Trait for classifying failures
///
/// For a breaker, `true` records the error as a failure and `false` ignores
/// the call entirely. For a retry, `true` makes the error retryable.
///
/// # Examples
///
/// ```rust
/// use resilience_machines::{FailureClassifier, FailureContext};
///
/// #[derive(Debug)]
/// struct ServerErrorClassifier;
///
/// impl FailureClassifier for ServerErrorClassifier {
///     fn classify(&self, ctx: &FailureContext<'_>) -> bool {
///         // Client errors (4xx) say nothing about the dependency's health
///         ctx.error
///             .downcast_ref::<u16>()
///             .map(|status| *status >= 500)
///             .unwrap_or(true)
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    fn classify(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Default classifier that counts every error
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Predicate-based classifier using a closure
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn classify(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(error: &'a dyn Any, duration: Duration) -> FailureContext<'a> {
        FailureContext {
            name: "test",
            error,
            duration,
            attempt: 1,
        }
    }

    #[test]
    fn test_default_classifier_counts_all() {
        let error = "any error";
        assert!(DefaultClassifier.classify(&ctx(&error, Duration::ZERO)));
    }

    #[test]
    fn test_predicate_classifier_on_duration() {
        let classifier = PredicateClassifier::new(|ctx| ctx.duration > Duration::from_secs(1));
        let error = "error";

        assert!(!classifier.classify(&ctx(&error, Duration::from_millis(500))));
        assert!(classifier.classify(&ctx(&error, Duration::from_secs(2))));
    }

    #[test]
    fn test_error_type_downcast() {
        #[derive(Debug)]
        struct MyError {
            is_server_error: bool,
        }

        let classifier = PredicateClassifier::new(|ctx| {
            ctx.error
                .downcast_ref::<MyError>()
                .map(|e| e.is_server_error)
                .unwrap_or(true)
        });

        let server = MyError {
            is_server_error: true,
        };
        let client = MyError {
            is_server_error: false,
        };
        let unknown = 42_u8;

        assert!(classifier.classify(&ctx(&server, Duration::ZERO)));
        assert!(!classifier.classify(&ctx(&client, Duration::ZERO)));
        assert!(classifier.classify(&ctx(&unknown, Duration::ZERO)));
    }
}
