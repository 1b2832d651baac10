//! Staged Inference Pipeline
//!
//! Perception → Prediction → Reasoning → Validation, each remote-dependent
//! stage guarded by a `ResilientCaller` with a deterministic fallback.
//!
//! Components:
//! - `collaborators`: capability interfaces and their mock variants
//! - `live`: HTTP-backed collaborators
//! - `rules`: fallback forecasts, rule-based assessment and audit rules
//! - `stage`: `StageRunner` (caller + fallback)
//! - `orchestrator`: per-request state machine

pub mod collaborators;
pub mod live;
pub mod orchestrator;
pub mod rules;
pub mod stage;

pub use collaborators::{Collaborators, MockPerception, MockReasoner, Mode, Perception, Reasoner};
pub use live::{LivePerception, LiveReasoner};
pub use orchestrator::{
    PipelineConfig, PipelineOrchestrator, PipelineRequest, PipelineResponse, PredictionSource,
};
pub use rules::RiskThresholds;
pub use stage::{StageOutcome, StageRunner};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed confidence attached to every fallback result
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Dependency names used as registry keys
pub const PERCEPTION_DEPENDENCY: &str = "perception";
pub const PREDICTION_DEPENDENCY: &str = "predictive_model";
pub const REASONING_DEPENDENCY: &str = "reasoning_llm";

/// One sequential unit of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Perception,
    Prediction,
    Reasoning,
    Validation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Perception => "PERCEPTION",
            Self::Prediction => "PREDICTION",
            Self::Reasoning => "REASONING",
            Self::Validation => "VALIDATION",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// End-to-end request failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("request aborted at {stage}: {reason}")]
    Aborted { stage: Stage, reason: String },

    #[error("request cancelled at {stage}")]
    Cancelled { stage: Stage },
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Aborted { stage, .. } | Self::Cancelled { stage } => *stage,
        }
    }
}
