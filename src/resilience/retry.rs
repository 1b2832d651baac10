//! Exponential backoff retry with jitter

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::{CallError, ResilienceError};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub exponential_base: f64,
    /// Scale each delay by a uniform factor in [0.5, 1.0)
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// One attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Many fast retries, for local dependencies
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            exponential_base: 1.5,
            jitter: true,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Unjittered delay after the given zero-based failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Delay to sleep after the given attempt, jittered when enabled
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.backoff(attempt);
        if self.jitter {
            base.mul_f64(rng.gen_range(0.5..1.0))
        } else {
            base
        }
    }

    /// Run `operation` under this policy without breaker or limiter.
    ///
    /// Non-retryable failures propagate immediately; the last failure is
    /// surfaced as `Exhausted` once attempts run out.
    pub async fn retry<F, Fut, T>(&self, dependency: &str, mut operation: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !error.is_retryable() {
                return Err(ResilienceError::NonRetryable {
                    dependency: dependency.to_string(),
                    source: error,
                });
            }

            attempt += 1;
            if attempt >= max_attempts {
                return Err(ResilienceError::Exhausted {
                    dependency: dependency.to_string(),
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = self.delay_for_attempt(attempt - 1);
            debug!(
                dependency,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    fn exact_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_retry_policy_delay() {
        let policy = exact_policy();

        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn test_retry_policy_max_cap() {
        let policy = RetryPolicy {
            exponential_base: 10.0,
            max_delay: Duration::from_secs(5),
            ..exact_policy()
        };

        // Should be capped at 5 seconds
        assert_eq!(policy.backoff(2), Duration::from_secs(5));
        assert_eq!(policy.backoff(5000), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = exact_policy().with_jitter(true);
        let mut rng = StdRng::seed_from_u64(42);

        for attempt in 0..4 {
            let base = policy.backoff(attempt);
            for _ in 0..200 {
                let delay = policy.delay_with_rng(attempt, &mut rng);
                assert!(delay >= base.mul_f64(0.5), "{:?} below half of {:?}", delay, base);
                assert!(delay <= base, "{:?} above {:?}", delay, base);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_observed_delays() {
        let policy = exact_policy();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let recorded = calls.clone();
        let result: Result<(), _> = policy
            .retry("flaky", || {
                let recorded = recorded.clone();
                async move {
                    recorded.lock().push(Instant::now());
                    Err(CallError::transient("connection reset"))
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::Exhausted { attempts: 3, .. })
        ));

        let calls = calls.lock();
        assert_eq!(calls.len(), 3); // no fourth attempt
        assert_eq!(calls[1] - calls[0], Duration::from_secs(1));
        assert_eq!(calls[2] - calls[1], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_propagates_immediately() {
        let policy = exact_policy();
        let attempts = Arc::new(Mutex::new(0));

        let counter = attempts.clone();
        let result: Result<(), _> = policy
            .retry("strict", || {
                let counter = counter.clone();
                async move {
                    *counter.lock() += 1;
                    Err(CallError::validation("bad request"))
                }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::NonRetryable { .. })));
        assert_eq!(*attempts.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_later_attempt() {
        let policy = exact_policy();
        let attempts = Arc::new(Mutex::new(0));

        let counter = attempts.clone();
        let result = policy
            .retry("flaky", || {
                let counter = counter.clone();
                async move {
                    let mut n = counter.lock();
                    *n += 1;
                    if *n < 2 {
                        Err(CallError::transient("temporary failure"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*attempts.lock(), 2);
    }
}
