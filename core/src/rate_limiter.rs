//! Fixed-period rate limiter
//!
//! `limit_for_period` permissions become available at every
//! `limit_refresh_period` boundary. Unused permissions are not carried over,
//! and the available count never goes negative: a caller that finds none
//! either waits for the next boundary (within its timeout) or is rejected.

use crate::callbacks::{ComponentKind, Decision, EventSinks};
use crate::cancel::CancellationToken;
use crate::clock::{Clock, MonotonicClock};
use crate::errors::{ConfigError, Rejection};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateLimiterConfig {
    /// Permissions available in each period
    pub limit_for_period: u32,
    /// Length of a period
    pub limit_refresh_period: Duration,
    /// Default wait for a permission
    pub timeout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 50,
            limit_refresh_period: Duration::from_nanos(500),
            timeout_duration: Duration::from_secs(5),
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit_for_period == 0 {
            return Err(ConfigError::Zero {
                field: "limit_for_period",
            });
        }
        if self.limit_refresh_period.is_zero() {
            return Err(ConfigError::Zero {
                field: "limit_refresh_period",
            });
        }
        Ok(())
    }
}

/// Point-in-time limiter state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterMetrics {
    pub available_permissions: u32,
    pub number_of_waiting_threads: usize,
}

#[derive(Debug)]
struct Cycle {
    index: u128,
    permissions: u32,
}

/// Admission throttle for one dependency
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    cycle: Mutex<Cycle>,
    waiting: AtomicUsize,
    clock: Arc<dyn Clock>,
    sinks: EventSinks,
}

impl RateLimiter {
    /// # Panics
    ///
    /// Panics if `config` fails [`RateLimiterConfig::validate`].
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self::with_clock(name, config, Arc::new(MonotonicClock::new()))
    }

    /// # Panics
    ///
    /// Panics if `config` fails [`RateLimiterConfig::validate`].
    pub fn with_clock(
        name: impl Into<String>,
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        if let Err(e) = config.validate() {
            panic!("Invalid rate limiter configuration: {}", e);
        }
        let index = clock.now().as_nanos() / config.limit_refresh_period.as_nanos();
        Self {
            name: name.into(),
            cycle: Mutex::new(Cycle {
                index,
                permissions: config.limit_for_period,
            }),
            config,
            waiting: AtomicUsize::new(0),
            clock,
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

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Take a permission, waiting up to the configured `timeout_duration`
    pub fn acquire_permission(&self) -> Result<(), Rejection> {
        self.try_acquire_permission(self.config.timeout_duration)
    }

    /// Take a permission, waiting up to `timeout` for the next refill
    pub fn try_acquire_permission(&self, timeout: Duration) -> Result<(), Rejection> {
        self.acquire_within(timeout, None)
    }

    /// Take a permission, waiting up to `timeout` unless `cancel` fires first
    pub fn acquire_within(
        &self,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), Rejection> {
        let deadline = self.clock.now().saturating_add(timeout);

        loop {
            let now = self.clock.now();
            let next_refill = match self.take(now) {
                Ok(()) => {
                    self.sinks.admission(
                        ComponentKind::RateLimiter,
                        &self.name,
                        Decision::Permitted,
                        None,
                    );
                    return Ok(());
                }
                Err(next_refill) => next_refill,
            };

            if next_refill > deadline {
                return Err(self.reject(timeout, "no permission within timeout"));
            }

            self.waiting.fetch_add(1, Ordering::AcqRel);
            let cancelled = match cancel {
                Some(token) => token.sleep(next_refill.saturating_sub(now)),
                None => {
                    self.clock.sleep(next_refill.saturating_sub(now));
                    false
                }
            };
            self.waiting.fetch_sub(1, Ordering::AcqRel);

            if cancelled {
                return Err(self.reject(timeout, "wait cancelled"));
            }
        }
    }

    /// Consume one permission of the current cycle, or report when the next cycle starts
    fn take(&self, now: Duration) -> Result<(), Duration> {
        let period = self.config.limit_refresh_period.as_nanos();
        let index = now.as_nanos() / period;

        let mut cycle = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);
        if index > cycle.index {
            cycle.index = index;
            cycle.permissions = self.config.limit_for_period;
        }

        if cycle.permissions > 0 {
            cycle.permissions -= 1;
            return Ok(());
        }

        let next = (cycle.index + 1) * period;
        Err(Duration::from_nanos(
            u64::try_from(next).unwrap_or(u64::MAX),
        ))
    }

    fn reject(&self, timeout: Duration, reason: &str) -> Rejection {
        tracing::event!(
            name: "resilience.rate_limiter.rejected",
            tracing::Level::WARN,
            rate_limiter.name = %self.name,
            rate_limiter.timeout = timeout.as_secs_f32(),
            rate_limiter.reason = reason,
        );
        self.sinks.admission(
            ComponentKind::RateLimiter,
            &self.name,
            Decision::Rejected,
            Some(reason.to_string()),
        );
        Rejection::RateLimitExceeded {
            limiter: self.name.clone(),
            timeout,
        }
    }

    /// Permissions left in the current period
    pub fn available_permissions(&self) -> u32 {
        let index = self.clock.now().as_nanos() / self.config.limit_refresh_period.as_nanos();
        let cycle = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);
        if index > cycle.index {
            self.config.limit_for_period
        } else {
            cycle.permissions
        }
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        RateLimiterMetrics {
            available_permissions: self.available_permissions(),
            number_of_waiting_threads: self.waiting.load(Ordering::Acquire),
        }
    }
}
