//! Composition of guards around one operation
//!
//! Guards always wrap in the same order, outermost first:
//! retry, circuit breaker, rate limiter, bulkhead, operation.
//! Retry therefore sees breaker rejections and decides on them itself, and
//! the breaker records rate limiter and bulkhead rejections as failures so
//! saturation shows up as degraded health.

use crate::bulkhead::{Bulkhead, BulkheadGuard};
use crate::cancel::CancellationToken;
use crate::circuit::CircuitBreaker;
use crate::errors::ResilienceError;
use crate::rate_limiter::RateLimiter;
use crate::retry::Retry;
use crate::thread_pool::{JoinError, ThreadPoolBulkhead};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

type Operation<T, E> = Arc<dyn Fn() -> Result<T, E> + Send + Sync>;
type FallbackHandler<T, E> = Box<dyn Fn(&ResilienceError<E>) -> Option<T> + Send + Sync>;

enum Isolation {
    Semaphore(Arc<Bulkhead>),
    ThreadPool(Arc<ThreadPoolBulkhead>),
}

/// Builder collecting the guards for one operation
///
/// ```rust
/// use resilience_machines::{Bulkhead, CircuitBreaker, Decorators, Retry, RetryConfig};
/// use std::sync::Arc;
///
/// let breaker = Arc::new(CircuitBreaker::builder("inventory").build());
/// let bulkhead = Arc::new(Bulkhead::new("inventory", 10));
/// let retry = Arc::new(Retry::new("inventory", RetryConfig::default()));
///
/// let lookup = Decorators::of(|| Ok::<_, String>(42))
///     .with_retry(retry)
///     .with_circuit_breaker(breaker)
///     .with_bulkhead(bulkhead)
///     .with_fallback(|_err| Some(0))
///     .build();
///
/// assert_eq!(lookup.call().unwrap(), 42);
/// ```
pub struct Decorators<T, E> {
    operation: Operation<T, E>,
    retry: Option<Arc<Retry>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    isolation: Option<Isolation>,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    fallbacks: Vec<FallbackHandler<T, E>>,
}

impl<T, E> Decorators<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Start decorating `operation`
    pub fn of<F>(operation: F) -> Self
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
    {
        Self {
            operation: Arc::new(operation),
            retry: None,
            circuit_breaker: None,
            rate_limiter: None,
            isolation: None,
            timeout: None,
            cancel: None,
            fallbacks: Vec::new(),
        }
    }

    pub fn with_retry(mut self, retry: Arc<Retry>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Isolate with a semaphore bulkhead (replaces a thread pool bulkhead)
    pub fn with_bulkhead(mut self, bulkhead: Arc<Bulkhead>) -> Self {
        self.isolation = Some(Isolation::Semaphore(bulkhead));
        self
    }

    /// Run attempts on a thread pool bulkhead (replaces a semaphore bulkhead)
    pub fn with_thread_pool_bulkhead(mut self, pool: Arc<ThreadPoolBulkhead>) -> Self {
        self.isolation = Some(Isolation::ThreadPool(pool));
        self
    }

    /// Give up on an attempt after `timeout`
    ///
    /// The attempt runs on a helper thread (or its pool worker) and keeps its
    /// bulkhead permit until it actually finishes.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Abort bulkhead and rate limiter waits when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Append a recovery handler; handlers run in order until one returns `Some`
    pub fn with_fallback<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ResilienceError<E>) -> Option<T> + Send + Sync + 'static,
    {
        self.fallbacks.push(Box::new(handler));
        self
    }

    /// Append a recovery handler that only sees guard rejections
    pub fn with_rejection_fallback<F>(self, handler: F) -> Self
    where
        F: Fn(&ResilienceError<E>) -> Option<T> + Send + Sync + 'static,
    {
        self.with_fallback(move |error| {
            if error.is_rejection() {
                handler(error)
            } else {
                None
            }
        })
    }

    pub fn build(self) -> Decorated<T, E> {
        Decorated {
            operation: self.operation,
            retry: self.retry,
            circuit_breaker: self.circuit_breaker,
            rate_limiter: self.rate_limiter,
            isolation: self.isolation,
            timeout: self.timeout,
            cancel: self.cancel,
            fallbacks: self.fallbacks,
        }
    }
}

/// An operation wrapped in its guards, callable any number of times
pub struct Decorated<T, E> {
    operation: Operation<T, E>,
    retry: Option<Arc<Retry>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    isolation: Option<Isolation>,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    fallbacks: Vec<FallbackHandler<T, E>>,
}

impl<T, E> Decorated<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn call(&self) -> Result<T, ResilienceError<E>> {
        let result = match &self.retry {
            Some(retry) => retry.execute(|_| self.attempt()),
            None => self.attempt(),
        };

        result.or_else(|error| self.recover(error))
    }

    fn recover(&self, error: ResilienceError<E>) -> Result<T, ResilienceError<E>> {
        for (index, handler) in self.fallbacks.iter().enumerate() {
            if let Some(value) = handler(&error) {
                tracing::event!(
                    name: "resilience.fallback",
                    tracing::Level::WARN,
                    fallback.index = index,
                    fallback.error = error.kind().as_str(),
                );
                return Ok(value);
            }
        }
        Err(error)
    }

    /// One attempt through breaker, limiter and bulkhead
    fn attempt(&self) -> Result<T, ResilienceError<E>> {
        let Some(circuit) = &self.circuit_breaker else {
            return self.admitted();
        };

        let permit = circuit.try_acquire_permission()?;
        let clock = circuit.clock();
        let start = clock.now();
        let result = self.admitted();
        let elapsed = clock.now().saturating_sub(start);

        match &result {
            Ok(_) => permit.on_success(elapsed),
            Err(ResilienceError::OperationFailed(e)) => permit.on_error(elapsed, e),
            // Limiter and bulkhead rejections, timeouts
            Err(_) => permit.on_failure(elapsed),
        }
        result
    }

    fn admitted(&self) -> Result<T, ResilienceError<E>> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire_within(limiter.config().timeout_duration, self.cancel.as_ref())?;
        }

        match &self.isolation {
            Some(Isolation::Semaphore(bulkhead)) => {
                let guard = bulkhead
                    .acquire_within(bulkhead.config().max_wait_duration, self.cancel.as_ref())?;
                self.run(Some(guard))
            }
            Some(Isolation::ThreadPool(pool)) => self.run_on_pool(pool),
            None => self.run(None),
        }
    }

    fn run(&self, guard: Option<BulkheadGuard>) -> Result<T, ResilienceError<E>> {
        let Some(timeout) = self.timeout else {
            let _guard = guard;
            return (self.operation)().map_err(ResilienceError::OperationFailed);
        };

        let operation = Arc::clone(&self.operation);
        let (tx, rx) = mpsc::sync_channel(1);
        let handle = thread::spawn(move || {
            let _guard = guard;
            // The caller may have timed out already
            let _ = tx.send(operation());
        });

        match rx.recv_timeout(timeout) {
            Ok(result) => result.map_err(ResilienceError::OperationFailed),
            Err(RecvTimeoutError::Timeout) => Err(self.timed_out(timeout)),
            Err(RecvTimeoutError::Disconnected) => match handle.join() {
                Err(panic) => std::panic::resume_unwind(panic),
                Ok(()) => Err(self.timed_out(timeout)),
            },
        }
    }

    fn run_on_pool(&self, pool: &ThreadPoolBulkhead) -> Result<T, ResilienceError<E>> {
        let operation = Arc::clone(&self.operation);
        let handle = pool.submit(move || operation())?;

        let joined = match self.timeout {
            Some(timeout) => handle.join_timeout(timeout),
            None => handle.join(),
        };
        match joined {
            Ok(result) => result.map_err(ResilienceError::OperationFailed),
            Err(JoinError::TimedOut) => Err(self.timed_out(self.timeout.unwrap_or_default())),
            Err(JoinError::Abandoned) => Err(ResilienceError::BulkheadFull {
                bulkhead: pool.name().to_string(),
                limit: pool.capacity(),
            }),
        }
    }

    fn timed_out(&self, timeout: Duration) -> ResilienceError<E> {
        tracing::event!(
            name: "resilience.timeout",
            tracing::Level::WARN,
            timeout = timeout.as_secs_f32(),
        );
        ResilienceError::OperationTimedOut { timeout }
    }
}

impl<T, E> std::fmt::Debug for Decorated<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decorated")
            .field("retry", &self.retry.as_ref().map(|r| r.name().to_string()))
            .field(
                "circuit_breaker",
                &self.circuit_breaker.as_ref().map(|c| c.name().to_string()),
            )
            .field(
                "rate_limiter",
                &self.rate_limiter.as_ref().map(|r| r.name().to_string()),
            )
            .field("timeout", &self.timeout)
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}
