//! Name-keyed registry of shared breakers and limiters.
//!
//! Passed explicitly to whoever needs a guarded dependency. Every caller
//! built for the same name shares one breaker and one limiter; the first
//! configuration registered for a name wins.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{
    BreakerSnapshot, CallerConfig, CircuitBreaker, CircuitBreakerConfig, RateLimitConfig,
    RateLimiter, ResilientCaller,
};

#[derive(Default)]
pub struct ResilienceRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl ResilienceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Breaker for `name`, created with the default config if absent
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breaker_with(name, CircuitBreakerConfig::default())
    }

    /// Breaker for `name`, created with `config` if absent
    pub fn breaker_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(dependency = name, "Registering circuit breaker");
                Arc::new(CircuitBreaker::with_config(name, config))
            })
            .clone()
    }

    /// Limiter for `name`, created with `config` if absent
    pub fn limiter(&self, name: &str, config: RateLimitConfig) -> Arc<RateLimiter> {
        self.limiters
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(dependency = name, rate = config.rate, "Registering rate limiter");
                Arc::new(RateLimiter::new(name, config))
            })
            .clone()
    }

    /// Build a caller that shares this registry's instances for `name`
    pub fn caller(&self, name: &str, config: &CallerConfig) -> ResilientCaller {
        let breaker = self.breaker_with(name, config.breaker.clone());
        let limiter = config
            .rate_limit
            .clone()
            .map(|rl| self.limiter(name, rl));
        ResilientCaller::new(name, breaker, limiter, config.retry.clone(), config.timeout)
    }

    /// Health view of every registered breaker, sorted by name
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        let mut snapshots: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
