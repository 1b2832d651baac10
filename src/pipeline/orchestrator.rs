//! Pipeline Orchestrator
//!
//! Per-request state machine:
//!
//! ```text
//! PERCEPTION → PREDICTION → REASONING → VALIDATION → DONE
//!      └────────────┴────────────┴────────────┴──→ ABORTED / CANCELLED
//! ```
//!
//! Every stage records exactly one reasoning entry. A stage whose primary
//! path fails falls back where it can; the request aborts only when a stage
//! has nothing to fall back to. Validation is purely local and never fails.

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::collaborators::Collaborators;
use super::rules::{audit, persistence_forecast, rule_assessment, RiskThresholds};
use super::stage::{StageOutcome, StageRunner};
use super::{
    PipelineError, Stage, FALLBACK_CONFIDENCE, PERCEPTION_DEPENDENCY, PREDICTION_DEPENDENCY,
    REASONING_DEPENDENCY,
};
use crate::metrics::PipelineMetrics;
use crate::model::PredictiveModel;
use crate::reasoning_log::{digest, EntryOutcome, ReasoningEntry, ReasoningLog};
use crate::resilience::{CallError, CallerConfig, CallerStats, ResilienceRegistry};
use crate::tracker::PredictionTracker;
use crate::types::{Action, AuditVerification, MarketState, Prediction, RiskAssessment};

/// Resilience settings per stage plus the fallback thresholds
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub perception: CallerConfig,
    pub prediction: CallerConfig,
    pub reasoning: CallerConfig,
    pub thresholds: RiskThresholds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            perception: CallerConfig::default(),
            prediction: CallerConfig::local(),
            reasoning: CallerConfig::default(),
            thresholds: RiskThresholds::default(),
        }
    }
}

/// One evaluation request
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRequest {
    pub action: Action,
    /// Pre-perceived state; when absent the perception collaborator is asked
    pub state: Option<MarketState>,
}

impl PipelineRequest {
    pub fn new(action: Action) -> Self {
        Self { action, state: None }
    }

    pub fn with_state(mut self, state: MarketState) -> Self {
        self.state = Some(state);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    Model,
    Persistence,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResponse {
    pub chain_id: String,
    pub action: Action,
    pub current_state: MarketState,
    pub predicted_state: MarketState,
    pub prediction_source: PredictionSource,
    /// Tracked prediction, present only when the model produced the forecast
    pub prediction: Option<Prediction>,
    pub assessment: RiskAssessment,
    pub verification: AuditVerification,
    pub degraded_stages: Vec<Stage>,
}

impl PipelineResponse {
    pub fn is_degraded(&self) -> bool {
        !self.degraded_stages.is_empty()
    }
}

/// Reasoning entries for one request
struct Trail<'a> {
    log: &'a dyn ReasoningLog,
    chain_id: String,
    step: u32,
}

impl<'a> Trail<'a> {
    fn new(log: &'a dyn ReasoningLog) -> Self {
        Self {
            log,
            chain_id: format!("chain_{}", uuid::Uuid::new_v4().simple()),
            step: 0,
        }
    }

    fn record(
        &mut self,
        stage: Stage,
        input_digest: &str,
        outcome: EntryOutcome,
        reason: Option<String>,
        confidence: f64,
        started: Instant,
    ) {
        self.step += 1;
        self.log.append(ReasoningEntry {
            chain_id: self.chain_id.clone(),
            step: self.step,
            stage,
            input_digest: input_digest.to_string(),
            outcome,
            reason,
            confidence,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: chrono::Utc::now(),
        });
    }
}

/// Resolves once the cancel flag is set. Pends forever if the sender is gone.
async fn until_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// `None` if cancelled before `fut` completed. Dropping `fut` releases any
/// limiter token or breaker trial it held.
async fn race<T>(cancel: &mut watch::Receiver<bool>, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = until_cancelled(cancel) => None,
        out = fut => Some(out),
    }
}

pub struct PipelineOrchestrator {
    collaborators: Collaborators,
    model: Arc<PredictiveModel>,
    tracker: Arc<PredictionTracker>,
    reasoning_log: Arc<dyn ReasoningLog>,
    metrics: Arc<PipelineMetrics>,
    thresholds: RiskThresholds,
    perception: StageRunner,
    prediction: StageRunner,
    reasoning: StageRunner,
    /// Last successfully perceived state, the perception fallback
    last_state: Mutex<Option<MarketState>>,
}

impl PipelineOrchestrator {
    pub fn new(
        collaborators: Collaborators,
        model: Arc<PredictiveModel>,
        tracker: Arc<PredictionTracker>,
        reasoning_log: Arc<dyn ReasoningLog>,
        metrics: Arc<PipelineMetrics>,
        registry: &ResilienceRegistry,
        config: PipelineConfig,
    ) -> Self {
        Self {
            perception: StageRunner::new(
                Stage::Perception,
                registry.caller(PERCEPTION_DEPENDENCY, &config.perception),
            ),
            prediction: StageRunner::new(
                Stage::Prediction,
                registry.caller(PREDICTION_DEPENDENCY, &config.prediction),
            ),
            reasoning: StageRunner::new(
                Stage::Reasoning,
                registry.caller(REASONING_DEPENDENCY, &config.reasoning),
            ),
            collaborators,
            model,
            tracker,
            reasoning_log,
            metrics,
            thresholds: config.thresholds,
            last_state: Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn last_state(&self) -> Option<MarketState> {
        *self.last_state.lock()
    }

    /// Caller statistics for every remote-dependent stage
    pub fn stage_stats(&self) -> Vec<CallerStats> {
        vec![
            self.perception.stats(),
            self.prediction.stats(),
            self.reasoning.stats(),
        ]
    }

    /// Run a request to completion
    pub async fn run(&self, request: PipelineRequest) -> Result<PipelineResponse, PipelineError> {
        let (_keep_alive, cancel) = watch::channel(false);
        self.run_with_cancel(request, cancel).await
    }

    /// Run a request, abandoning it when `cancel` flips to `true`
    pub async fn run_with_cancel(
        &self,
        request: PipelineRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<PipelineResponse, PipelineError> {
        let started = Instant::now();
        self.metrics.record_request();
        let mut trail = Trail::new(self.reasoning_log.as_ref());
        let action = request.action;
        let mut degraded_stages = Vec::new();

        info!(chain_id = %trail.chain_id, action = %action, "Pipeline request started");

        // Perception
        let stage_start = Instant::now();
        let input = digest(&request);
        self.check_cancel(&cancel, &mut trail, Stage::Perception, &input, stage_start)?;
        let outcome = match request.state {
            Some(state) => match state.validate() {
                Ok(()) => StageOutcome::Succeeded(state),
                Err(e) => StageOutcome::Aborted(format!("invalid market state: {}", e)),
            },
            None => {
                let fut = self.perception.run(
                    || {
                        let perception = self.collaborators.perception.clone();
                        async move { perception.fetch_state().await }
                    },
                    |_| self.last_state(),
                );
                match race(&mut cancel, fut).await {
                    Some(outcome) => outcome,
                    None => return Err(self.cancelled(&mut trail, Stage::Perception, &input, stage_start)),
                }
            }
        };
        let (current, degraded) =
            self.settle(&mut trail, Stage::Perception, &input, outcome, |_| 1.0, stage_start)?;
        if degraded {
            degraded_stages.push(Stage::Perception);
        } else {
            *self.last_state.lock() = Some(current);
        }

        // Prediction
        let stage_start = Instant::now();
        let input = digest(&(current, action));
        self.check_cancel(&cancel, &mut trail, Stage::Prediction, &input, stage_start)?;
        let fut = self.prediction.run(
            || {
                let model = self.model.clone();
                async move { Ok::<_, CallError>(model.predict(&current, action)) }
            },
            |_| Some((persistence_forecast(&current), FALLBACK_CONFIDENCE)),
        );
        let outcome = match race(&mut cancel, fut).await {
            Some(outcome) => outcome,
            None => return Err(self.cancelled(&mut trail, Stage::Prediction, &input, stage_start)),
        };
        let ((predicted, model_confidence), prediction_degraded) =
            self.settle(&mut trail, Stage::Prediction, &input, outcome, |(_, c)| *c, stage_start)?;

        // Tracked only once the request completes
        let forecast = if prediction_degraded {
            degraded_stages.push(Stage::Prediction);
            None
        } else {
            Some(Prediction::new(current, action, predicted, model_confidence))
        };

        // Reasoning
        let stage_start = Instant::now();
        let input = digest(&(current, predicted));
        self.check_cancel(&cancel, &mut trail, Stage::Reasoning, &input, stage_start)?;
        let thresholds = &self.thresholds;
        let outcome = if prediction_degraded {
            StageOutcome::Degraded {
                value: rule_assessment(&current, &predicted, thresholds, FALLBACK_CONFIDENCE),
                reason: "upstream prediction degraded".to_string(),
            }
        } else {
            let fut = self.reasoning.run(
                || {
                    let reasoner = self.collaborators.reasoner.clone();
                    async move { reasoner.assess(&current, &predicted).await }
                },
                |_| Some(rule_assessment(&current, &predicted, thresholds, FALLBACK_CONFIDENCE)),
            );
            match race(&mut cancel, fut).await {
                Some(outcome) => outcome,
                None => return Err(self.cancelled(&mut trail, Stage::Reasoning, &input, stage_start)),
            }
        };
        let (assessment, reasoning_degraded) =
            self.settle(&mut trail, Stage::Reasoning, &input, outcome, |a| a.confidence, stage_start)?;
        if reasoning_degraded {
            degraded_stages.push(Stage::Reasoning);
        }

        // Validation
        let stage_start = Instant::now();
        let input = digest(&assessment);
        self.check_cancel(&cancel, &mut trail, Stage::Validation, &input, stage_start)?;
        let verification = audit(&assessment, !degraded_stages.is_empty());
        trail.record(
            Stage::Validation,
            &input,
            EntryOutcome::Success,
            (!verification.approved).then(|| verification.comments.clone()),
            1.0,
            stage_start,
        );

        let prediction = forecast.and_then(|p| match self.tracker.record(p) {
            Ok(p) => {
                self.metrics.record_prediction();
                Some(p)
            }
            Err(e) => {
                warn!(chain_id = %trail.chain_id, "Failed to track prediction: {}", e);
                None
            }
        });

        let degraded = !degraded_stages.is_empty();
        self.metrics.record_completed(started.elapsed(), degraded);
        info!(
            chain_id = %trail.chain_id,
            risk = assessment.risk_level.as_str(),
            action = assessment.recommended_action.as_str(),
            approved = verification.approved,
            degraded,
            "Pipeline request complete"
        );

        Ok(PipelineResponse {
            chain_id: trail.chain_id,
            action,
            current_state: current,
            predicted_state: predicted,
            prediction_source: if prediction_degraded {
                PredictionSource::Persistence
            } else {
                PredictionSource::Model
            },
            prediction,
            assessment,
            verification,
            degraded_stages,
        })
    }

    /// Log a stage outcome and unwrap its value; `bool` is true when degraded
    fn settle<T>(
        &self,
        trail: &mut Trail<'_>,
        stage: Stage,
        input: &str,
        outcome: StageOutcome<T>,
        confidence: impl Fn(&T) -> f64,
        started: Instant,
    ) -> Result<(T, bool), PipelineError> {
        match outcome {
            StageOutcome::Succeeded(value) => {
                let c = confidence(&value);
                trail.record(stage, input, EntryOutcome::Success, None, c, started);
                Ok((value, false))
            }
            StageOutcome::Degraded { value, reason } => {
                self.metrics.record_fallback(stage);
                let c = confidence(&value).min(FALLBACK_CONFIDENCE);
                trail.record(stage, input, EntryOutcome::Fallback, Some(reason), c, started);
                Ok((value, true))
            }
            StageOutcome::Aborted(reason) => {
                self.metrics.record_aborted();
                trail.record(stage, input, EntryOutcome::Aborted, Some(reason.clone()), 0.0, started);
                error!(chain_id = %trail.chain_id, stage = %stage, "Pipeline request aborted: {}", reason);
                Err(PipelineError::Aborted { stage, reason })
            }
        }
    }

    fn check_cancel(
        &self,
        cancel: &watch::Receiver<bool>,
        trail: &mut Trail<'_>,
        stage: Stage,
        input: &str,
        started: Instant,
    ) -> Result<(), PipelineError> {
        if *cancel.borrow() {
            Err(self.cancelled(trail, stage, input, started))
        } else {
            Ok(())
        }
    }

    fn cancelled(&self, trail: &mut Trail<'_>, stage: Stage, input: &str, started: Instant) -> PipelineError {
        self.metrics.record_cancelled();
        trail.record(
            stage,
            input,
            EntryOutcome::Cancelled,
            Some("request cancelled".to_string()),
            0.0,
            started,
        );
        info!(chain_id = %trail.chain_id, stage = %stage, "Pipeline request cancelled");
        PipelineError::Cancelled { stage }
    }
}
