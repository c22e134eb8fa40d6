//! Error types for guarded calls
//!
//! Guards report a [`Rejection`] when they refuse admission. Decorated calls
//! report a [`ResilienceError`], which keeps rejections distinguishable from
//! failures of the protected operation itself.

use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Why a circuit breaker refused a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Circuit is open and the wait duration has not elapsed
    Open,
    /// Circuit was forced open by an operator
    ForcedOpen,
    /// All half-open trial calls are already in flight
    HalfOpenLimitReached,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Open => "circuit is open",
            RejectReason::ForcedOpen => "circuit is forced open",
            RejectReason::HalfOpenLimitReached => "half-open trial calls exhausted",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission refused by a guard; no permit is held
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("Circuit '{circuit}' does not permit calls: {reason}")]
    CallNotPermitted {
        circuit: String,
        reason: RejectReason,
    },
    #[error("Bulkhead '{bulkhead}' is full (limit: {limit})")]
    BulkheadFull { bulkhead: String, limit: usize },
    #[error("Rate limiter '{limiter}' has no permission available within {timeout:?}")]
    RateLimitExceeded { limiter: String, timeout: Duration },
}

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be within 0..=100, got {value}")]
    PercentageOutOfRange { field: &'static str, value: f32 },
    #[error("{field} must be within 0.0..=1.0, got {value}")]
    FactorOutOfRange { field: &'static str, value: f64 },
    #[error("{field} must be greater than 0")]
    Zero { field: &'static str },
    #[error("{field} must be at least {min}, got {value}")]
    TooSmall {
        field: &'static str,
        min: f64,
        value: f64,
    },
}

/// Coarse classification of a [`ResilienceError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    CallNotPermitted,
    BulkheadFull,
    RateLimitExceeded,
    OperationFailed,
    OperationTimedOut,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::CallNotPermitted => "call_not_permitted",
            ErrorKind::BulkheadFull => "bulkhead_full",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::OperationFailed => "operation_failed",
            ErrorKind::OperationTimedOut => "operation_timed_out",
        }
    }

    /// Process exit code for command-line callers
    ///
    /// Rejections map to 75 (`EX_TEMPFAIL`), timeouts to 124 and operation
    /// failures to 1.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::CallNotPermitted
            | ErrorKind::BulkheadFull
            | ErrorKind::RateLimitExceeded => 75,
            ErrorKind::OperationTimedOut => 124,
            ErrorKind::OperationFailed => 1,
        }
    }

    /// Whether a guard refused the call before the operation ran
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            ErrorKind::CallNotPermitted | ErrorKind::BulkheadFull | ErrorKind::RateLimitExceeded
        )
    }
}

/// Errors that can occur during a guarded call
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// Circuit breaker rejected the call
    CallNotPermitted {
        circuit: String,
        reason: RejectReason,
    },
    /// Bulkhead is at capacity, cannot acquire permit
    BulkheadFull { bulkhead: String, limit: usize },
    /// No rate limiter permission within the configured wait
    RateLimitExceeded { limiter: String, timeout: Duration },
    /// The wrapped operation failed
    OperationFailed(E),
    /// The wrapped operation exceeded its deadline
    OperationTimedOut { timeout: Duration },
    /// Every retry attempt failed; holds the last cause
    RetriesExhausted {
        attempts: u32,
        last: Box<ResilienceError<E>>,
    },
}

impl<E> ResilienceError<E> {
    /// Classification, looking through `RetriesExhausted` to its last cause
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResilienceError::CallNotPermitted { .. } => ErrorKind::CallNotPermitted,
            ResilienceError::BulkheadFull { .. } => ErrorKind::BulkheadFull,
            ResilienceError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            ResilienceError::OperationFailed(_) => ErrorKind::OperationFailed,
            ResilienceError::OperationTimedOut { .. } => ErrorKind::OperationTimedOut,
            ResilienceError::RetriesExhausted { last, .. } => last.kind(),
        }
    }

    /// Whether a guard refused the call (directly, or on the last retry)
    pub fn is_rejection(&self) -> bool {
        self.kind().is_rejection()
    }

    /// Exit code of [`kind`](Self::kind)
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// The operation's own error, if that is what ended the call
    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::OperationFailed(e) => Some(e),
            ResilienceError::RetriesExhausted { last, .. } => last.into_inner(),
            _ => None,
        }
    }

    /// Borrowing variant of [`into_inner`](Self::into_inner)
    pub fn inner(&self) -> Option<&E> {
        match self {
            ResilienceError::OperationFailed(e) => Some(e),
            ResilienceError::RetriesExhausted { last, .. } => last.inner(),
            _ => None,
        }
    }
}

impl<E> From<Rejection> for ResilienceError<E> {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::CallNotPermitted { circuit, reason } => {
                ResilienceError::CallNotPermitted { circuit, reason }
            }
            Rejection::BulkheadFull { bulkhead, limit } => {
                ResilienceError::BulkheadFull { bulkhead, limit }
            }
            Rejection::RateLimitExceeded { limiter, timeout } => {
                ResilienceError::RateLimitExceeded { limiter, timeout }
            }
        }
    }
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResilienceError::CallNotPermitted { circuit, reason } => {
                write!(f, "Circuit '{}' does not permit calls: {}", circuit, reason)
            }
            ResilienceError::BulkheadFull { bulkhead, limit } => {
                write!(f, "Bulkhead '{}' is full (limit: {})", bulkhead, limit)
            }
            ResilienceError::RateLimitExceeded { limiter, timeout } => write!(
                f,
                "Rate limiter '{}' has no permission available within {:?}",
                limiter, timeout
            ),
            ResilienceError::OperationFailed(e) => write!(f, "Operation failed: {}", e),
            ResilienceError::OperationTimedOut { timeout } => {
                write!(f, "Operation timed out after {:?}", timeout)
            }
            ResilienceError::RetriesExhausted { attempts, last } => {
                write!(f, "Retries exhausted after {} attempts: {}", attempts, last)
            }
        }
    }
}

impl<E: Error + 'static> Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ResilienceError::OperationFailed(e) => Some(e),
            ResilienceError::RetriesExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("boom")
        }
    }

    impl Error for Boom {}

    #[test]
    fn test_rejection_converts_to_matching_kind() {
        let err: ResilienceError<Boom> = Rejection::BulkheadFull {
            bulkhead: "db".into(),
            limit: 2,
        }
        .into();

        assert_eq!(err.kind(), ErrorKind::BulkheadFull);
        assert!(err.is_rejection());
        assert_eq!(err.exit_code(), 75);
        assert_eq!(err.to_string(), "Bulkhead 'db' is full (limit: 2)");
    }

    #[test]
    fn test_operation_failure_is_not_rejection() {
        let err = ResilienceError::OperationFailed(Boom);

        assert!(!err.is_rejection());
        assert_eq!(err.exit_code(), 1);
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "Operation failed: boom");
    }

    #[test]
    fn test_retries_exhausted_reports_last_cause() {
        let err = ResilienceError::RetriesExhausted {
            attempts: 3,
            last: Box::new(ResilienceError::<Boom>::OperationTimedOut {
                timeout: Duration::from_secs(1),
            }),
        };

        assert_eq!(err.kind(), ErrorKind::OperationTimedOut);
        assert_eq!(err.exit_code(), 124);
        assert_eq!(
            err.to_string(),
            "Retries exhausted after 3 attempts: Operation timed out after 1s"
        );
        assert!(err.into_inner().is_none());
    }

    #[test]
    fn test_into_inner_unwraps_retries() {
        let err = ResilienceError::RetriesExhausted {
            attempts: 2,
            last: Box::new(ResilienceError::OperationFailed("down")),
        };

        assert_eq!(err.inner(), Some(&"down"));
        assert_eq!(err.into_inner(), Some("down"));
    }

    #[test]
    fn test_reject_reason_display() {
        let rejection = Rejection::CallNotPermitted {
            circuit: "payments".into(),
            reason: RejectReason::HalfOpenLimitReached,
        };

        assert_eq!(
            rejection.to_string(),
            "Circuit 'payments' does not permit calls: half-open trial calls exhausted"
        );
    }
}
