//! SenseForge
//!
//! Resilient multi-stage inference pipeline for DeFi governance risk.
//!
//! # Features
//!
//! - **Pipeline**: Perception → Prediction → Reasoning → Validation, one reasoning entry per stage
//! - **Resilience**: token-bucket rate limiting, circuit breakers and jittered retry per dependency
//! - **Fallbacks**: last known state, persistence forecast, rule-based risk assessment
//! - **Learning**: residual predictive model trained from resolved predictions
//! - **Tracking**: prediction maturity, resolution and accuracy statistics
//!
//! # Architecture
//!
//! ```text
//! request ──► Orchestrator ──► Perception ──► Prediction ──► Reasoning ──► Validation
//!                  │               │              │              │
//!                  │          ResilientCaller (limiter · breaker · retry · timeout)
//!                  │
//!                  ├── PredictionTracker ──► AccuracyLog (SQLite) ──► ReplayBuffer ──► Trainer
//!                  ├── ReasoningLog (JSON lines)
//!                  └── PipelineMetrics
//! ```

pub mod accuracy_log;
pub mod config;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod reasoning_log;
pub mod resilience;
pub mod tracker;
pub mod types;

pub use accuracy_log::{AccuracyLog, MemoryAccuracyLog, SqliteAccuracyLog};
pub use config::Config;
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use model::{ModelConfig, PredictiveModel, ReplayBuffer, Trainer, TrainerConfig};
pub use pipeline::{
    Collaborators, Mode, PipelineConfig, PipelineError, PipelineOrchestrator, PipelineRequest,
    PipelineResponse, Stage,
};
pub use reasoning_log::{JsonlReasoningLog, MemoryReasoningLog, ReasoningEntry, ReasoningLog};
pub use resilience::{
    CallError, CallerConfig, CircuitBreaker, CircuitState, RateLimiter, ResilienceError,
    ResilienceRegistry, ResilientCaller, RetryPolicy,
};
pub use tracker::{AccuracyStats, PredictionTracker, TrackerError};
pub use types::{Action, MarketState, Prediction, ResolvedSample, RiskAssessment};
