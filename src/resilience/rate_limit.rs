//! Token Bucket Rate Limiting
//!
//! Caps the call rate to one external dependency.
//!
//! Features:
//! - Lazy refill computed from elapsed time (no background timer)
//! - Fail-fast or blocking admission
//! - Permits that refund their token if dropped before the guarded call starts

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::ResilienceError;

/// Tolerance for float drift when a sleep lands exactly on the refill instant
const TOKEN_EPSILON: f64 = 1e-9;

/// How `acquire` behaves when the bucket is empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Refuse immediately with `RateLimited`
    FailFast,
    /// Sleep until the next token, refusing only if the wait exceeds `max_wait`
    Block { max_wait: Duration },
}

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens refilled per period
    pub rate: u32,
    /// Refill period
    pub period: Duration,
    /// Bucket size (burst allowance)
    pub capacity: u32,
    /// Behaviour on an empty bucket
    pub mode: AcquireMode,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate: 10,                       // 10 calls
            period: Duration::from_secs(60), // per minute
            capacity: 10,
            mode: AcquireMode::Block {
                max_wait: Duration::from_secs(60),
            },
        }
    }
}

impl RateLimitConfig {
    /// `rate` calls per minute, burst equal to rate, blocking admission
    pub fn per_minute(rate: u32) -> Self {
        Self {
            rate,
            capacity: rate,
            ..Default::default()
        }
    }

    /// Switch to fail-fast admission
    pub fn fail_fast(mut self) -> Self {
        self.mode = AcquireMode::FailFast;
        self
    }

    /// Switch to blocking admission
    pub fn blocking(mut self, max_wait: Duration) -> Self {
        self.mode = AcquireMode::Block { max_wait };
        self
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiter bound to one dependency name
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
    admitted: AtomicU64,
    refused: AtomicU64,
}

impl RateLimiter {
    /// Create a full bucket
    pub fn new(name: &str, config: RateLimitConfig) -> Self {
        Self {
            name: name.to_string(),
            bucket: Mutex::new(Bucket {
                tokens: config.capacity as f64,
                last_refill: Instant::now(),
            }),
            config,
            admitted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take a token without waiting, whatever the configured mode
    pub fn try_acquire(&self) -> Result<RateLimitPermit<'_>, ResilienceError> {
        match self.take() {
            Ok(()) => Ok(self.admit()),
            Err(wait) => Err(self.refuse(wait)),
        }
    }

    /// Take a token, waiting for a refill in blocking mode.
    ///
    /// The bucket lock is never held while sleeping.
    pub async fn acquire(&self) -> Result<RateLimitPermit<'_>, ResilienceError> {
        loop {
            let wait = match self.take() {
                Ok(()) => return Ok(self.admit()),
                Err(wait) => wait,
            };

            match self.config.mode {
                AcquireMode::FailFast => return Err(self.refuse(wait)),
                AcquireMode::Block { max_wait } if wait > max_wait => {
                    return Err(self.refuse(wait));
                }
                AcquireMode::Block { .. } => {
                    debug!(dependency = %self.name, wait_ms = wait.as_millis() as u64, "Waiting for rate limit token");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Tokens currently available (after refill)
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    /// Admissions and refusals so far
    pub fn counts(&self) -> (u64, u64) {
        (
            self.admitted.load(Ordering::Relaxed),
            self.refused.load(Ordering::Relaxed),
        )
    }

    /// Consume one token or report how long until one is available
    fn take(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());

        if bucket.tokens + TOKEN_EPSILON >= 1.0 {
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
            Ok(())
        } else {
            let missing = 1.0 - bucket.tokens;
            Err(self.token_interval().mul_f64(missing))
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let period = self.config.period.as_secs_f64();
        let capacity = self.config.capacity as f64;

        if period <= 0.0 {
            bucket.tokens = capacity;
        } else {
            let added = elapsed.as_secs_f64() / period * self.config.rate as f64;
            bucket.tokens = (bucket.tokens + added).min(capacity);
        }
        bucket.last_refill = now;
    }

    fn token_interval(&self) -> Duration {
        if self.config.rate == 0 {
            self.config.period
        } else {
            self.config.period / self.config.rate
        }
    }

    fn refund(&self) {
        let mut bucket = self.bucket.lock();
        bucket.tokens = (bucket.tokens + 1.0).min(self.config.capacity as f64);
        self.admitted.fetch_sub(1, Ordering::Relaxed);
        debug!(dependency = %self.name, "Refunded unused rate limit token");
    }

    fn admit(&self) -> RateLimitPermit<'_> {
        self.admitted.fetch_add(1, Ordering::Relaxed);
        RateLimitPermit {
            limiter: self,
            committed: false,
        }
    }

    fn refuse(&self, retry_after: Duration) -> ResilienceError {
        self.refused.fetch_add(1, Ordering::Relaxed);
        warn!(
            dependency = %self.name,
            retry_after_ms = retry_after.as_millis() as u64,
            "Rate limit exceeded"
        );
        ResilienceError::RateLimited {
            dependency: self.name.clone(),
            retry_after,
        }
    }
}

/// A taken token. Dropping it without [`RateLimitPermit::commit`] puts the token back.
#[must_use = "dropping a permit without commit() refunds the token"]
pub struct RateLimitPermit<'a> {
    limiter: &'a RateLimiter,
    committed: bool,
}

impl RateLimitPermit<'_> {
    /// Mark the token as spent on a real call
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for RateLimitPermit<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.limiter.refund();
        }
    }
}
