//! Resilience Primitives
//!
//! Failure isolation for every remote-dependent stage:
//! - Token bucket rate limiting (admission control)
//! - Circuit breaker (three-state failure isolator)
//! - Exponential backoff retry with jitter
//! - `ResilientCaller` composing all three around one operation
//! - `ResilienceRegistry` holding the name-keyed shared instances
//!
//! Industry standard: Netflix Hystrix, resilience4j

pub mod caller;
pub mod circuit_breaker;
pub mod rate_limit;
pub mod registry;
pub mod retry;

pub use caller::{CallerConfig, CallerStats, ResilientCaller};
pub use circuit_breaker::{
    BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use rate_limit::{AcquireMode, RateLimitConfig, RateLimitPermit, RateLimiter};
pub use registry::ResilienceRegistry;
pub use retry::RetryPolicy;

use std::time::Duration;

/// Classification of collaborator errors for recovery strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure, retry likely to succeed
    Transient,
    /// Per-call deadline elapsed
    Timeout,
    /// Remote side asked us to slow down
    RateLimited,
    /// Resource unavailable, may recover
    ResourceUnavailable,
    /// Invalid input, retry won't help
    Validation,
    /// Response could not be parsed
    Malformed,
    /// Authorization failed, needs intervention
    Auth,
    /// Remote internal error
    System,
    /// Unknown error type
    Unknown,
}

impl ErrorClass {
    /// Classify an error from its message
    pub fn from_message(error: &str) -> Self {
        let lower = error.to_lowercase();

        if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429") {
            Self::RateLimited
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout
        } else if lower.contains("connection") || lower.contains("temporary") {
            Self::Transient
        } else if lower.contains("unavailable") || lower.contains("503") || lower.contains("not found") {
            Self::ResourceUnavailable
        } else if lower.contains("parse") || lower.contains("malformed") || lower.contains("decode") {
            Self::Malformed
        } else if lower.contains("invalid") || lower.contains("validation") || lower.contains("400") {
            Self::Validation
        } else if lower.contains("unauthorized") || lower.contains("forbidden") || lower.contains("401") || lower.contains("403") {
            Self::Auth
        } else if lower.contains("internal") || lower.contains("500") {
            Self::System
        } else {
            Self::Unknown
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient | Self::Timeout | Self::RateLimited | Self::ResourceUnavailable | Self::Unknown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ResourceUnavailable => "resource_unavailable",
            Self::Validation => "validation",
            Self::Malformed => "malformed",
            Self::Auth => "auth",
            Self::System => "system",
            Self::Unknown => "unknown",
        }
    }
}

/// Failure reported by a guarded operation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{} error: {}", .class.as_str(), .message)]
pub struct CallError {
    pub class: ErrorClass,
    pub message: String,
}

impl CallError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(ErrorClass::Timeout, format!("call timed out after {:?}", after))
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Malformed, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, message)
    }

    /// Classify an untyped error by its message
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorClass::from_message(&message), message)
    }

    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}

impl From<anyhow::Error> for CallError {
    fn from(error: anyhow::Error) -> Self {
        Self::from_message(format!("{:#}", error))
    }
}

/// Tagged failure surfaced by the resilience layer
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResilienceError {
    #[error("rate limited on '{dependency}', retry after {retry_after:?}")]
    RateLimited {
        dependency: String,
        retry_after: Duration,
    },

    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("'{dependency}' failed after {attempts} attempts: {last_error}")]
    Exhausted {
        dependency: String,
        attempts: u32,
        #[source]
        last_error: CallError,
    },

    #[error("'{dependency}' failed with non-retryable error: {source}")]
    NonRetryable {
        dependency: String,
        #[source]
        source: CallError,
    },
}

impl ResilienceError {
    /// Short tag for logs and reasoning entries
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Exhausted { .. } => "exhausted",
            Self::NonRetryable { .. } => "non_retryable",
        }
    }
}
