//! Named guard instances shared across an application
//!
//! A `Registry` hands out one instance per name and kind, created on first
//! use from per-kind default configurations. Every instance it creates shares
//! the registry's clock and event sinks.

use crate::bulkhead::{Bulkhead, BulkheadConfig};
use crate::callbacks::{EventSink, EventSinks};
use crate::circuit::{CircuitBreaker, CircuitConfig, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::errors::ConfigError;
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::retry::{Retry, RetryConfig};
use crate::thread_pool::{ThreadPoolBulkhead, ThreadPoolBulkheadConfig};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

/// Configurations used for instances created without an explicit one
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RegistryDefaults {
    pub circuit_breaker: CircuitConfig,
    pub bulkhead: BulkheadConfig,
    pub thread_pool_bulkhead: ThreadPoolBulkheadConfig,
    pub rate_limiter: RateLimiterConfig,
    pub retry: RetryConfig,
}

impl RegistryDefaults {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        self.bulkhead.validate()?;
        self.thread_pool_bulkhead.validate()?;
        self.rate_limiter.validate()?;
        self.retry.validate()
    }
}

/// Why a thread pool bulkhead could not be created
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to spawn bulkhead worker threads: {0}")]
    Spawn(#[from] std::io::Error),
}

type Instances<V> = RwLock<HashMap<String, Arc<V>>>;

/// Get-or-create store of named guards
#[derive(Debug)]
pub struct Registry {
    defaults: RegistryDefaults,
    clock: Arc<dyn Clock>,
    sinks: EventSinks,
    circuit_breakers: Instances<CircuitBreaker>,
    bulkheads: Instances<Bulkhead>,
    thread_pool_bulkheads: Instances<ThreadPoolBulkhead>,
    rate_limiters: Instances<RateLimiter>,
    retries: Instances<Retry>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            defaults: RegistryDefaults::default(),
            clock: Arc::new(MonotonicClock::new()),
            sinks: EventSinks::new(),
            circuit_breakers: RwLock::new(HashMap::new()),
            bulkheads: RwLock::new(HashMap::new()),
            thread_pool_bulkheads: RwLock::new(HashMap::new()),
            rate_limiters: RwLock::new(HashMap::new()),
            retries: RwLock::new(HashMap::new()),
        }
    }

    /// Registry whose instances default to `defaults`
    pub fn with_defaults(defaults: RegistryDefaults) -> Result<Self, ConfigError> {
        defaults.validate()?;
        Ok(Self {
            defaults,
            ..Self::new()
        })
    }

    /// Time source shared by every instance created afterwards
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sink shared by every instance created afterwards
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn defaults(&self) -> &RegistryDefaults {
        &self.defaults
    }

    /// Circuit breaker `name`, created with the default configuration if missing
    pub fn circuit_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        let config = &self.defaults.circuit_breaker;
        get_or_insert(&self.circuit_breakers, name, || self.new_circuit_breaker(name, config))
    }

    /// Circuit breaker `name`; `config` only applies if it has to be created
    pub fn circuit_breaker_with(
        &self,
        name: &str,
        config: CircuitConfig,
    ) -> Result<Arc<CircuitBreaker>, ConfigError> {
        config.validate()?;
        Ok(get_or_insert(&self.circuit_breakers, name, || {
            self.new_circuit_breaker(name, &config)
        }))
    }

    fn new_circuit_breaker(&self, name: &str, config: &CircuitConfig) -> CircuitBreaker {
        CircuitBreaker::builder(name)
            .config(config.clone())
            .clock(Arc::clone(&self.clock))
            .event_sinks(self.sinks.clone())
            .build()
    }

    /// Apply `config` to an existing circuit breaker
    ///
    /// Returns `Ok(false)` if no breaker is registered under `name`.
    pub fn reconfigure_circuit_breaker(
        &self,
        name: &str,
        config: CircuitConfig,
    ) -> Result<bool, ConfigError> {
        let circuit = self
            .circuit_breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();

        match circuit {
            Some(circuit) => circuit.reconfigure(config).map(|()| true),
            None => Ok(false),
        }
    }

    /// State of every registered circuit breaker, sorted by name
    pub fn circuit_breaker_states(&self) -> BTreeMap<String, CircuitState> {
        self.circuit_breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, circuit)| (name.clone(), circuit.state()))
            .collect()
    }

    pub fn remove_circuit_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.circuit_breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn bulkhead(&self, name: &str) -> Arc<Bulkhead> {
        let config = &self.defaults.bulkhead;
        get_or_insert(&self.bulkheads, name, || self.new_bulkhead(name, config))
    }

    pub fn bulkhead_with(
        &self,
        name: &str,
        config: BulkheadConfig,
    ) -> Result<Arc<Bulkhead>, ConfigError> {
        config.validate()?;
        Ok(get_or_insert(&self.bulkheads, name, || self.new_bulkhead(name, &config)))
    }

    fn new_bulkhead(&self, name: &str, config: &BulkheadConfig) -> Bulkhead {
        Bulkhead::with_config(name, config.clone()).with_sinks(self.sinks.clone())
    }

    /// Thread pool bulkhead `name`; spawns its workers if it has to be created
    pub fn thread_pool_bulkhead(
        &self,
        name: &str,
    ) -> Result<Arc<ThreadPoolBulkhead>, RegistryError> {
        self.thread_pool_bulkhead_with(name, self.defaults.thread_pool_bulkhead.clone())
    }

    pub fn thread_pool_bulkhead_with(
        &self,
        name: &str,
        config: ThreadPoolBulkheadConfig,
    ) -> Result<Arc<ThreadPoolBulkhead>, RegistryError> {
        config.validate()?;
        if let Some(pool) = self
            .thread_pool_bulkheads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(Arc::clone(pool));
        }

        let mut pools = self
            .thread_pool_bulkheads
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = pools.get(name) {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(
            ThreadPoolBulkhead::with_config(name, config)?.with_sinks(self.sinks.clone()),
        );
        pools.insert(name.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    pub fn rate_limiter(&self, name: &str) -> Arc<RateLimiter> {
        let config = &self.defaults.rate_limiter;
        get_or_insert(&self.rate_limiters, name, || self.new_rate_limiter(name, config))
    }

    pub fn rate_limiter_with(
        &self,
        name: &str,
        config: RateLimiterConfig,
    ) -> Result<Arc<RateLimiter>, ConfigError> {
        config.validate()?;
        Ok(get_or_insert(&self.rate_limiters, name, || {
            self.new_rate_limiter(name, &config)
        }))
    }

    fn new_rate_limiter(&self, name: &str, config: &RateLimiterConfig) -> RateLimiter {
        RateLimiter::with_clock(name, config.clone(), Arc::clone(&self.clock))
            .with_sinks(self.sinks.clone())
    }

    pub fn retry(&self, name: &str) -> Arc<Retry> {
        let config = &self.defaults.retry;
        get_or_insert(&self.retries, name, || self.new_retry(name, config))
    }

    pub fn retry_with(&self, name: &str, config: RetryConfig) -> Result<Arc<Retry>, ConfigError> {
        config.validate()?;
        Ok(get_or_insert(&self.retries, name, || self.new_retry(name, &config)))
    }

    fn new_retry(&self, name: &str, config: &RetryConfig) -> Retry {
        Retry::with_clock(name, config.clone(), Arc::clone(&self.clock))
            .with_sinks(self.sinks.clone())
    }
}

/// Double-checked get-or-create: readers never take the write lock
fn get_or_insert<V>(instances: &Instances<V>, name: &str, create: impl FnOnce() -> V) -> Arc<V> {
    if let Some(existing) = instances
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
    {
        return Arc::clone(existing);
    }

    let mut instances = instances.write().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(
        instances
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(create())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::TransitionEvent;
    use crate::clock::ManualClock;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Transitions(Mutex<Vec<TransitionEvent>>);

    impl EventSink for Transitions {
        fn on_transition(&self, event: &TransitionEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_same_name_returns_same_instance() {
        let registry = Registry::new();

        let a = registry.circuit_breaker("payments");
        let b = registry.circuit_breaker("payments");
        let c = registry.circuit_breaker("inventory");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(Arc::ptr_eq(&registry.bulkhead("db"), &registry.bulkhead("db")));
        assert!(Arc::ptr_eq(&registry.retry("db"), &registry.retry("db")));
    }

    #[test]
    fn test_explicit_config_only_applies_on_creation() {
        let registry = Registry::new();
        let config = BulkheadConfig {
            max_concurrent_calls: 3,
            ..Default::default()
        };

        let first = registry.bulkhead_with("db", config).unwrap();
        let second = registry.bulkhead("db");

        assert_eq!(first.limit(), 3);
        assert_eq!(second.limit(), 3);
        assert!(
            registry
                .bulkhead_with(
                    "other",
                    BulkheadConfig {
                        max_concurrent_calls: 0,
                        ..Default::default()
                    }
                )
                .is_err()
        );
    }

    #[test]
    fn test_shared_sinks_and_states() {
        let sink = Arc::new(Transitions::default());
        let registry = Registry::new()
            .with_clock(Arc::new(ManualClock::new()))
            .with_event_sink(sink.clone());

        let payments = registry.circuit_breaker("payments");
        registry.circuit_breaker("inventory");
        payments.transition_to_forced_open_state();

        let states = registry.circuit_breaker_states();
        assert_eq!(states["payments"], CircuitState::ForcedOpen);
        assert_eq!(states["inventory"], CircuitState::Closed);

        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "payments");
        assert_eq!(events[0].to, CircuitState::ForcedOpen);
    }

    #[test]
    fn test_reconfigure_registered_breaker() {
        let registry = Registry::new();
        let circuit = registry.circuit_breaker("payments");

        let config = CircuitConfig {
            wait_duration_in_open_state: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(registry.reconfigure_circuit_breaker("payments", config.clone()), Ok(true));
        assert_eq!(circuit.config(), config);
        assert_eq!(registry.reconfigure_circuit_breaker("missing", config), Ok(false));
    }

    #[test]
    fn test_invalid_defaults_rejected() {
        let defaults = RegistryDefaults {
            rate_limiter: RateLimiterConfig {
                limit_for_period: 0,
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(Registry::with_defaults(defaults).is_err());
    }

    #[test]
    fn test_thread_pool_bulkhead_created_once() {
        let registry = Registry::new();
        let config = ThreadPoolBulkheadConfig {
            max_thread_pool_size: 1,
            queue_capacity: 1,
        };

        let pool = registry.thread_pool_bulkhead_with("reports", config).unwrap();
        let again = registry.thread_pool_bulkhead("reports").unwrap();

        assert!(Arc::ptr_eq(&pool, &again));
        assert_eq!(pool.capacity(), 2);
    }
}
