//! Resilient Caller
//!
//! Composes the three primitives around one fallible operation:
//! rate limit gate, then a breaker check before every attempt, then the
//! timeout-bounded call itself, retried with backoff.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    CallError, CircuitBreaker, CircuitBreakerConfig, RateLimitConfig, RateLimiter,
    ResilienceError, RetryPolicy,
};

/// Configuration for one guarded dependency
#[derive(Debug, Clone)]
pub struct CallerConfig {
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    /// `None` disables admission control
    pub rate_limit: Option<RateLimitConfig>,
    /// Per-attempt deadline
    pub timeout: Duration,
}

impl Default for CallerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            rate_limit: Some(RateLimitConfig::default()),
            timeout: Duration::from_secs(30),
        }
    }
}

impl CallerConfig {
    /// In-process dependency: no rate limit, quick retries
    pub fn local() -> Self {
        Self {
            retry: RetryPolicy::aggressive(),
            rate_limit: None,
            timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: Option<RateLimitConfig>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Counters for caller operations
#[derive(Default)]
struct CallerMetrics {
    calls: AtomicU64,
    successes: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    circuit_rejections: AtomicU64,
    rate_limited: AtomicU64,
}

/// Guards calls to one named dependency
pub struct ResilientCaller {
    name: String,
    breaker: Arc<CircuitBreaker>,
    limiter: Option<Arc<RateLimiter>>,
    retry: RetryPolicy,
    timeout: Duration,
    metrics: CallerMetrics,
}

impl ResilientCaller {
    /// Build a caller around shared primitives
    pub fn new(
        name: &str,
        breaker: Arc<CircuitBreaker>,
        limiter: Option<Arc<RateLimiter>>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            breaker,
            limiter,
            retry,
            timeout,
            metrics: CallerMetrics::default(),
        }
    }

    /// Build a caller with private breaker and limiter instances
    pub fn standalone(name: &str, config: &CallerConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::with_config(name, config.breaker.clone()));
        let limiter = config
            .rate_limit
            .clone()
            .map(|rl| Arc::new(RateLimiter::new(name, rl)));
        Self::new(name, breaker, limiter, config.retry.clone(), config.timeout)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    /// Execute `operation` with admission control, circuit breaking and retries.
    ///
    /// No lock is held across the operation or the backoff sleep. Dropping the
    /// returned future releases any unused limiter token and trial slot.
    pub async fn call<F, Fut, T>(&self, mut operation: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.metrics.calls.fetch_add(1, Ordering::Relaxed);

        let mut token = match &self.limiter {
            Some(limiter) => match limiter.acquire().await {
                Ok(permit) => Some(permit),
                Err(e) => {
                    self.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            },
            None => None,
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            let permit = match self.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(e) => {
                    self.metrics.circuit_rejections.fetch_add(1, Ordering::Relaxed);
                    if attempt > 0 {
                        warn!(dependency = %self.name, attempt, "Circuit opened mid-retry, aborting");
                    }
                    return Err(e);
                }
            };

            // The token is spent once a real invocation starts
            if let Some(token) = token.take() {
                token.commit();
            }

            let result = match tokio::time::timeout(self.timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(CallError::timeout(self.timeout)),
            };

            let error = match result {
                Ok(value) => {
                    permit.succeed();
                    self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(e) => {
                    permit.fail();
                    e
                }
            };

            if !error.is_retryable() {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                return Err(ResilienceError::NonRetryable {
                    dependency: self.name.clone(),
                    source: error,
                });
            }

            attempt += 1;
            if attempt >= max_attempts {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                warn!(dependency = %self.name, attempts = attempt, error = %error, "Retries exhausted");
                return Err(ResilienceError::Exhausted {
                    dependency: self.name.clone(),
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = self.retry.delay_for_attempt(attempt - 1);
            debug!(
                dependency = %self.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after failure"
            );
            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
        }
    }

    /// Get caller stats
    pub fn stats(&self) -> CallerStats {
        CallerStats {
            name: self.name.clone(),
            calls: self.metrics.calls.load(Ordering::Relaxed),
            successes: self.metrics.successes.load(Ordering::Relaxed),
            retries: self.metrics.retries.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            circuit_rejections: self.metrics.circuit_rejections.load(Ordering::Relaxed),
            rate_limited: self.metrics.rate_limited.load(Ordering::Relaxed),
        }
    }
}

/// Statistics for one caller
#[derive(Debug, Clone)]
pub struct CallerStats {
    pub name: String,
    pub calls: u64,
    pub successes: u64,
    pub retries: u64,
    pub failures: u64,
    pub circuit_rejections: u64,
    pub rate_limited: u64,
}

impl CallerStats {
    /// Calculate success rate
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            1.0
        } else {
            self.successes as f64 / self.calls as f64
        }
    }

    /// Format for display
    pub fn format(&self) -> String {
        format!(
            "{}: {:.1}% success ({}/{} calls, {} retries, {} failed, {} circuit-open, {} rate-limited)",
            self.name,
            self.success_rate() * 100.0,
            self.successes,
            self.calls,
            self.retries,
            self.failures,
            self.circuit_rejections,
            self.rate_limited
        )
    }
}
