//! Bulkhead implementation for concurrency limiting
//!
//! This module provides a semaphore-based bulkhead pattern to limit the number
//! of concurrent calls to a dependency. Callers may wait up to
//! `max_wait_duration` for a permit to free up; every permit is handed out as a
//! [`BulkheadGuard`] that releases it on drop, so release happens exactly once
//! on every exit path, panics included.

use crate::callbacks::{ComponentKind, Decision, EventSinks};
use crate::cancel::CancellationToken;
use crate::errors::{ConfigError, Rejection};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Slice used to re-check a cancellation token while waiting for a permit
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Semaphore bulkhead configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BulkheadConfig {
    /// Maximum number of concurrent permits
    pub max_concurrent_calls: usize,
    /// How long a caller may block waiting for a permit (zero = fail fast)
    pub max_wait_duration: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 25,
            max_wait_duration: Duration::ZERO,
        }
    }
}

impl BulkheadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::Zero {
                field: "max_concurrent_calls",
            });
        }
        Ok(())
    }
}

/// Point-in-time bulkhead usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadMetrics {
    pub available_concurrent_calls: usize,
    pub max_allowed_concurrent_calls: usize,
}

/// A semaphore-based bulkhead for limiting concurrent operations
///
/// Bulkheading prevents thread pool exhaustion by rejecting requests when a
/// maximum concurrency limit is reached.
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    /// Current number of acquired permits
    acquired: AtomicUsize,
    /// Waiters park here until a permit is released
    lock: Mutex<()>,
    released: Condvar,
    sinks: EventSinks,
}

impl Bulkhead {
    /// Create a fail-fast bulkhead with the given concurrency limit
    ///
    /// # Panics
    ///
    /// Panics if `limit` is 0.
    pub fn new(name: impl Into<String>, limit: usize) -> Self {
        Self::with_config(
            name,
            BulkheadConfig {
                max_concurrent_calls: limit,
                ..Default::default()
            },
        )
    }

    /// # Panics
    ///
    /// Panics if `config` fails [`BulkheadConfig::validate`].
    pub fn with_config(name: impl Into<String>, config: BulkheadConfig) -> Self {
        if let Err(e) = config.validate() {
            panic!("Invalid bulkhead configuration: {}", e);
        }
        Self {
            name: name.into(),
            config,
            acquired: AtomicUsize::new(0),
            lock: Mutex::new(()),
            released: Condvar::new(),
            sinks: EventSinks::new(),
        }
    }

    /// Attach event sinks for admission decisions
    pub fn with_sinks(mut self, sinks: EventSinks) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Try to acquire a permit without blocking
    ///
    /// Returns `Some(BulkheadGuard)` if a permit was acquired, or `None` if
    /// the bulkhead is at capacity. No admission event is emitted.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BulkheadGuard> {
        if self.try_increment() {
            Some(BulkheadGuard {
                bulkhead: Arc::clone(self),
            })
        } else {
            None
        }
    }

    /// Acquire a permit, waiting up to the configured `max_wait_duration`
    pub fn acquire(self: &Arc<Self>) -> Result<BulkheadGuard, Rejection> {
        self.acquire_within(self.config.max_wait_duration, None)
    }

    /// Acquire a permit, waiting up to `wait` unless `cancel` fires first
    pub fn acquire_within(
        self: &Arc<Self>,
        wait: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<BulkheadGuard, Rejection> {
        if self.try_increment() || (!wait.is_zero() && self.wait_for_permit(wait, cancel)) {
            self.sinks.admission(
                ComponentKind::Bulkhead,
                &self.name,
                Decision::Permitted,
                None,
            );
            return Ok(BulkheadGuard {
                bulkhead: Arc::clone(self),
            });
        }

        tracing::event!(
            name: "resilience.bulkhead.rejected",
            tracing::Level::WARN,
            bulkhead.name = %self.name,
            bulkhead.limit = self.config.max_concurrent_calls,
            bulkhead.waited = wait.as_secs_f32(),
        );
        self.sinks.admission(
            ComponentKind::Bulkhead,
            &self.name,
            Decision::Rejected,
            Some("bulkhead full".to_string()),
        );
        Err(Rejection::BulkheadFull {
            bulkhead: self.name.clone(),
            limit: self.config.max_concurrent_calls,
        })
    }

    fn wait_for_permit(&self, wait: Duration, cancel: Option<&CancellationToken>) -> bool {
        let deadline = Instant::now() + wait;
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if self.try_increment() {
                return true;
            }
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let slice = match cancel {
                Some(_) => remaining.min(CANCEL_POLL_INTERVAL),
                None => remaining,
            };
            guard = self
                .released
                .wait_timeout(guard, slice)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn try_increment(&self) -> bool {
        let mut current = self.acquired.load(Ordering::Acquire);

        loop {
            if current >= self.config.max_concurrent_calls {
                return false;
            }

            match self.acquired.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                // Another thread modified the counter, try again
                Err(actual) => current = actual,
            }
        }
    }

    /// Get the current number of acquired permits
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Acquire)
    }

    /// Get the maximum number of permits (bulkhead limit)
    pub fn limit(&self) -> usize {
        self.config.max_concurrent_calls
    }

    /// Get the number of available permits
    pub fn available(&self) -> usize {
        self.limit().saturating_sub(self.acquired())
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            available_concurrent_calls: self.available(),
            max_allowed_concurrent_calls: self.limit(),
        }
    }

    /// Release a permit (called by BulkheadGuard on drop)
    fn release(&self) {
        let released = self
            .acquired
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        if released.is_err() {
            tracing::event!(
                name: "resilience.bulkhead.over_release",
                tracing::Level::ERROR,
                bulkhead.name = %self.name,
            );
            debug_assert!(
                false,
                "bulkhead '{}' released more permits than it issued",
                self.name
            );
            return;
        }

        // Taking the lock orders this wake-up after a waiter's failed check.
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.released.notify_one();
    }
}

/// Guard that releases a bulkhead permit when dropped
///
/// This ensures that permits are always released, even if the guarded
/// operation panics.
#[derive(Debug)]
pub struct BulkheadGuard {
    bulkhead: Arc<Bulkhead>,
}

impl Drop for BulkheadGuard {
    fn drop(&mut self) {
        self.bulkhead.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_bulkhead_basic_acquire_release() {
        let bulkhead = Arc::new(Bulkhead::new("test", 3));

        assert_eq!(bulkhead.limit(), 3);
        assert_eq!(bulkhead.acquired(), 0);
        assert_eq!(bulkhead.available(), 3);

        let guard1 = bulkhead.try_acquire();
        assert!(guard1.is_some());
        assert_eq!(bulkhead.acquired(), 1);
        assert_eq!(bulkhead.available(), 2);

        let guard2 = bulkhead.acquire();
        assert!(guard2.is_ok());
        assert_eq!(bulkhead.acquired(), 2);

        drop(guard1);
        assert_eq!(bulkhead.acquired(), 1);

        drop(guard2);
        assert_eq!(bulkhead.acquired(), 0);
        assert_eq!(bulkhead.available(), 3);
    }

    #[test]
    fn test_bulkhead_at_capacity() {
        let bulkhead = Arc::new(Bulkhead::new("test", 2));

        let guard1 = bulkhead.acquire().expect("Should acquire");
        let _guard2 = bulkhead.acquire().expect("Should acquire");

        match bulkhead.acquire() {
            Err(Rejection::BulkheadFull { bulkhead: name, limit }) => {
                assert_eq!(name, "test");
                assert_eq!(limit, 2);
            }
            other => panic!("Expected BulkheadFull, got {:?}", other),
        }
        assert_eq!(bulkhead.acquired(), 2);

        drop(guard1);
        assert!(bulkhead.acquire().is_ok(), "Should acquire after release");
    }

    #[test]
    fn test_waiter_admitted_after_release() {
        let bulkhead = Arc::new(Bulkhead::with_config(
            "test",
            BulkheadConfig {
                max_concurrent_calls: 1,
                max_wait_duration: Duration::from_secs(5),
            },
        ));
        let guard = bulkhead.acquire().unwrap();

        let waiter = Arc::clone(&bulkhead);
        let handle = thread::spawn(move || waiter.acquire().map(drop).is_ok());

        thread::sleep(Duration::from_millis(20));
        drop(guard);

        assert!(handle.join().unwrap());
        assert_eq!(bulkhead.acquired(), 0);
    }

    #[test]
    fn test_wait_times_out() {
        let bulkhead = Arc::new(Bulkhead::new("test", 1));
        let _guard = bulkhead.acquire().unwrap();

        let start = Instant::now();
        let result = bulkhead.acquire_within(Duration::from_millis(30), None);

        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(bulkhead.acquired(), 1);
    }

    #[test]
    fn test_cancelled_wait_holds_no_permit() {
        let bulkhead = Arc::new(Bulkhead::new("test", 1));
        let guard = bulkhead.acquire().unwrap();
        let token = CancellationToken::new();

        let waiter = Arc::clone(&bulkhead);
        let waiter_token = token.clone();
        let handle = thread::spawn(move || {
            waiter
                .acquire_within(Duration::from_secs(30), Some(&waiter_token))
                .is_err()
        });

        thread::sleep(Duration::from_millis(20));
        token.cancel();

        assert!(handle.join().unwrap());
        drop(guard);
        assert_eq!(bulkhead.acquired(), 0);
    }

    #[test]
    fn test_bulkhead_never_exceeds_limit() {
        let bulkhead = Arc::new(Bulkhead::with_config(
            "test",
            BulkheadConfig {
                max_concurrent_calls: 3,
                max_wait_duration: Duration::from_secs(5),
            },
        ));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(12));

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let bulkhead = Arc::clone(&bulkhead);
                let in_flight = Arc::clone(&in_flight);
                let max_seen = Arc::clone(&max_seen);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let _guard = bulkhead.acquire().expect("waiters should be admitted");
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert_eq!(bulkhead.acquired(), 0);
    }

    #[test]
    #[should_panic(expected = "Invalid bulkhead configuration")]
    fn test_bulkhead_zero_limit() {
        Bulkhead::new("test", 0);
    }

    #[test]
    fn test_config_validation() {
        let config = BulkheadConfig {
            max_concurrent_calls: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "max_concurrent_calls"
            })
        );
        assert!(BulkheadConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bulkhead_guard_releases_on_panic() {
        let bulkhead = Arc::new(Bulkhead::new("test", 2));

        let bulkhead_clone = Arc::clone(&bulkhead);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = bulkhead_clone.try_acquire().unwrap();
            panic!("Simulated panic");
        }));

        assert!(result.is_err());
        assert_eq!(bulkhead.acquired(), 0);
    }
}
