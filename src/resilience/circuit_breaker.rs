//! Circuit Breaker
//!
//! Three-state failure isolator bound to one named dependency.
//! Admission and the half-open trial slot are granted under a single lock,
//! and every admission is represented by a [`BreakerPermit`] that must be
//! settled with `succeed()` or `fail()`. An abandoned trial permit frees the
//! slot on drop so a cancelled call cannot wedge the breaker in HALF_OPEN.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::ResilienceError;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Blocking all requests
    Open,
    /// Letting a single trial request through
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Time to wait before allowing a trial call
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Point-in-time view for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Milliseconds since the breaker last opened
    pub open_for_ms: Option<u64>,
}

/// Circuit breaker for preventing cascade failures
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: &str) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    /// Create with custom config
    pub fn with_config(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask for permission to invoke the dependency.
    ///
    /// OPEN moves to HALF_OPEN here once `recovery_timeout` has elapsed.
    /// While a trial is in flight every other caller is rejected as if OPEN.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, ResilienceError> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let recovered = inner
                .opened_at
                .map(|at| at.elapsed() >= self.config.recovery_timeout)
                .unwrap_or(true);
            if !recovered {
                return Err(ResilienceError::CircuitOpen(self.name.clone()));
            }
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
            info!(dependency = %self.name, "Circuit breaker transitioning to half-open");
        }

        match inner.state {
            CircuitState::Closed => Ok(self.permit(PermitKind::Normal)),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                debug!(dependency = %self.name, "Circuit breaker granted trial call");
                Ok(self.permit(PermitKind::Trial))
            }
            _ => Err(ResilienceError::CircuitOpen(self.name.clone())),
        }
    }

    /// Current state (no lazy transition)
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            open_for_ms: inner.opened_at.map(|at| at.elapsed().as_millis() as u64),
        }
    }

    /// Force the breaker open
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
        warn!(dependency = %self.name, "Circuit breaker tripped manually");
    }

    /// Reset the circuit breaker
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        info!(dependency = %self.name, "Circuit breaker reset");
    }

    fn permit(&self, kind: PermitKind) -> BreakerPermit<'_> {
        BreakerPermit {
            breaker: self,
            kind,
            settled: false,
        }
    }

    fn on_success(&self, kind: PermitKind) {
        let mut inner = self.inner.lock();
        match (kind, inner.state) {
            (PermitKind::Normal, CircuitState::Closed) => {
                inner.consecutive_failures = 0;
            }
            (PermitKind::Trial, CircuitState::HalfOpen) => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                info!(dependency = %self.name, "Circuit breaker closed after recovery");
            }
            // Late result from a permit issued under an earlier state
            _ => {}
        }
    }

    fn on_failure(&self, kind: PermitKind) {
        let mut inner = self.inner.lock();
        match (kind, inner.state) {
            (PermitKind::Normal, CircuitState::Closed) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        dependency = %self.name,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opened"
                    );
                }
            }
            (PermitKind::Trial, CircuitState::HalfOpen) => {
                inner.state = CircuitState::Open;
                inner.consecutive_failures += 1;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                warn!(dependency = %self.name, "Circuit breaker reopened after half-open failure");
            }
            _ => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            inner.trial_in_flight = false;
            debug!(dependency = %self.name, "Abandoned trial call released");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Normal,
    Trial,
}

/// Admission granted by [`CircuitBreaker::try_acquire`]
#[must_use = "a permit must be settled with succeed() or fail()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    kind: PermitKind,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this is the single HALF_OPEN trial call
    pub fn is_trial(&self) -> bool {
        self.kind == PermitKind::Trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.kind);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.kind);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.kind == PermitKind::Trial {
            self.breaker.release_trial();
        }
    }
}
