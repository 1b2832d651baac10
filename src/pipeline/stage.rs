//! Stage runner: one remote-dependent stage behind a `ResilientCaller`,
//! with the stage's fallback as an explicit second return path.

use std::future::Future;
use tracing::warn;

use super::Stage;
use crate::resilience::{CallError, CallerStats, ResilienceError, ResilientCaller};

/// Result of one stage call
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    /// Primary path succeeded
    Succeeded(T),
    /// Primary path failed; value came from the fallback
    Degraded { value: T, reason: String },
    /// Primary path failed and no fallback value was available
    Aborted(String),
}

impl<T> StageOutcome<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Succeeded(v) | Self::Degraded { value: v, .. } => Some(v),
            Self::Aborted(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Succeeded(v) | Self::Degraded { value: v, .. } => Some(v),
            Self::Aborted(_) => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Succeeded(_) => None,
            Self::Degraded { reason, .. } | Self::Aborted(reason) => Some(reason),
        }
    }
}

pub struct StageRunner {
    stage: Stage,
    caller: ResilientCaller,
}

impl StageRunner {
    pub fn new(stage: Stage, caller: ResilientCaller) -> Self {
        Self { stage, caller }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn stats(&self) -> CallerStats {
        self.caller.stats()
    }

    /// Run `operation` through the caller. On any resilience failure the
    /// fallback is consulted; `None` from it aborts the stage.
    pub async fn run<F, Fut, T, FB>(&self, operation: F, fallback: FB) -> StageOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
        FB: FnOnce(&ResilienceError) -> Option<T>,
    {
        match self.caller.call(operation).await {
            Ok(value) => StageOutcome::Succeeded(value),
            Err(error) => {
                let reason = error.to_string();
                match fallback(&error) {
                    Some(value) => {
                        warn!(stage = %self.stage, kind = error.kind(), "Stage degraded, using fallback: {}", reason);
                        StageOutcome::Degraded { value, reason }
                    }
                    None => {
                        warn!(stage = %self.stage, kind = error.kind(), "Stage failed with no fallback: {}", reason);
                        StageOutcome::Aborted(reason)
                    }
                }
            }
        }
    }
}
