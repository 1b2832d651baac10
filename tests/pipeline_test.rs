//! Pipeline Integration Tests
//!
//! End-to-end requests through the orchestrator with mock and failing
//! collaborators, checking fallbacks, the reasoning trail and cancellation.

use async_trait::async_trait;
use senseforge::model::{ModelConfig, PredictiveModel, ReplayBuffer};
use senseforge::pipeline::{
    Collaborators, MockPerception, MockReasoner, Perception, PipelineConfig, PipelineError,
    PipelineOrchestrator, PipelineRequest, PredictionSource, Reasoner, Stage,
    FALLBACK_CONFIDENCE, PREDICTION_DEPENDENCY, REASONING_DEPENDENCY,
};
use senseforge::reasoning_log::{EntryOutcome, MemoryReasoningLog};
use senseforge::resilience::{CallError, CallerConfig, CircuitState, ResilienceRegistry, RetryPolicy};
use senseforge::types::{
    Action, MarketState, RecommendedAction, RiskAssessment, RiskLevel,
};
use senseforge::{MemoryAccuracyLog, PipelineMetrics, PredictionTracker};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct Harness {
    orchestrator: PipelineOrchestrator,
    registry: ResilienceRegistry,
    log: Arc<MemoryReasoningLog>,
    tracker: Arc<PredictionTracker>,
    metrics: Arc<PipelineMetrics>,
}

fn harness_with(collaborators: Collaborators, config: PipelineConfig) -> Harness {
    let registry = ResilienceRegistry::new();
    let log = Arc::new(MemoryReasoningLog::new());
    let tracker = Arc::new(PredictionTracker::new(
        Duration::from_secs(300),
        Arc::new(ReplayBuffer::new(100)),
        Arc::new(MemoryAccuracyLog::new()),
    ));
    let metrics = Arc::new(PipelineMetrics::default());
    let model = Arc::new(PredictiveModel::new(ModelConfig::default()));

    let orchestrator = PipelineOrchestrator::new(
        collaborators,
        model,
        tracker.clone(),
        log.clone(),
        metrics.clone(),
        &registry,
        config,
    );

    Harness {
        orchestrator,
        registry,
        log,
        tracker,
        metrics,
    }
}

fn harness(collaborators: Collaborators) -> Harness {
    let config = PipelineConfig {
        perception: CallerConfig::default().with_retry(RetryPolicy::no_retry()),
        reasoning: CallerConfig::default().with_retry(RetryPolicy::no_retry()),
        ..Default::default()
    };
    harness_with(collaborators, config)
}

fn mock_collaborators() -> Collaborators {
    Collaborators::mock(7)
}

fn governance_state() -> MarketState {
    MarketState::new(9_500_000.0, 0.52, 0.35).unwrap()
}

/// Always fails with a retryable error
struct DownPerception;

#[async_trait]
impl Perception for DownPerception {
    fn name(&self) -> &str {
        "down"
    }

    async fn fetch_state(&self) -> Result<MarketState, CallError> {
        Err(CallError::transient("connection refused"))
    }
}

/// Succeeds once, then fails
struct FlakyPerception {
    calls: AtomicU32,
    state: MarketState,
}

#[async_trait]
impl Perception for FlakyPerception {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn fetch_state(&self) -> Result<MarketState, CallError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(self.state)
        } else {
            Err(CallError::transient("connection reset"))
        }
    }
}

struct SlowPerception;

#[async_trait]
impl Perception for SlowPerception {
    fn name(&self) -> &str {
        "slow"
    }

    async fn fetch_state(&self) -> Result<MarketState, CallError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(governance_state())
    }
}

struct SlowReasoner;

#[async_trait]
impl Reasoner for SlowReasoner {
    fn name(&self) -> &str {
        "slow"
    }

    async fn assess(
        &self,
        current: &MarketState,
        _predicted: &MarketState,
    ) -> Result<RiskAssessment, CallError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        MockReasoner::default().assess(current, current).await
    }
}

/// Returns unparsable output and counts invocations
#[derive(Default)]
struct GarbageReasoner {
    calls: AtomicU32,
}

#[async_trait]
impl Reasoner for GarbageReasoner {
    fn name(&self) -> &str {
        "garbage"
    }

    async fn assess(
        &self,
        _current: &MarketState,
        _predicted: &MarketState,
    ) -> Result<RiskAssessment, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CallError::malformed("No JSON object in completion"))
    }
}

#[tokio::test(start_paused = true)]
async fn test_healthy_request_logs_every_stage() {
    let h = harness(mock_collaborators());

    let response = h
        .orchestrator
        .run(PipelineRequest::new(Action::Pass).with_state(governance_state()))
        .await
        .unwrap();

    assert!(!response.is_degraded());
    assert_eq!(response.prediction_source, PredictionSource::Model);
    assert_eq!(response.current_state, governance_state());
    assert!(response.verification.approved);

    let prediction = response.prediction.expect("model prediction is tracked");
    assert_eq!(prediction.action, Action::Pass);
    assert_eq!(h.tracker.pending_count(), 1);

    let chain = h.log.chain(&response.chain_id);
    let stages: Vec<Stage> = chain.iter().map(|e| e.stage).collect();
    assert_eq!(
        stages,
        vec![Stage::Perception, Stage::Prediction, Stage::Reasoning, Stage::Validation]
    );
    let steps: Vec<u32> = chain.iter().map(|e| e.step).collect();
    assert_eq!(steps, vec![1, 2, 3, 4]);
    assert!(chain.iter().all(|e| e.outcome == EntryOutcome::Success));
    assert!(chain.iter().all(|e| e.input_digest.len() == 64));

    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.completed, 1);
    assert_eq!(snapshot.degraded, 0);
    assert_eq!(snapshot.predictions_recorded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_prediction_breaker_degrades_to_persistence() {
    let h = harness(mock_collaborators());
    h.registry.breaker(PREDICTION_DEPENDENCY).trip();

    let response = h
        .orchestrator
        .run(PipelineRequest::new(Action::Pass).with_state(governance_state()))
        .await
        .unwrap();

    assert_eq!(response.prediction_source, PredictionSource::Persistence);
    assert_eq!(response.predicted_state, governance_state());
    assert!(response.prediction.is_none());
    assert_eq!(h.tracker.pending_count(), 0);

    assert!(response.assessment.confidence <= FALLBACK_CONFIDENCE);
    assert_eq!(response.assessment.risk_level, RiskLevel::Safe);
    assert_eq!(response.assessment.recommended_action, RecommendedAction::Monitor);
    assert_eq!(
        response.degraded_stages,
        vec![Stage::Prediction, Stage::Reasoning]
    );
    assert!(response.verification.comments.contains("degraded"));

    let chain = h.log.chain(&response.chain_id);
    let prediction_entry = chain.iter().find(|e| e.stage == Stage::Prediction).unwrap();
    assert_eq!(prediction_entry.outcome, EntryOutcome::Fallback);
    assert!(prediction_entry.reason.is_some());

    let reasoning_entry = chain.iter().find(|e| e.stage == Stage::Reasoning).unwrap();
    assert_eq!(reasoning_entry.outcome, EntryOutcome::Fallback);
    assert_eq!(
        reasoning_entry.reason.as_deref(),
        Some("upstream prediction degraded")
    );

    assert_eq!(h.metrics.fallbacks(Stage::Prediction), 1);
}

#[tokio::test(start_paused = true)]
async fn test_identical_requests_yield_identical_assessments() {
    let first = harness(mock_collaborators());
    let second = harness(mock_collaborators());
    let request = PipelineRequest::new(Action::Reject).with_state(governance_state());

    let a = first.orchestrator.run(request.clone()).await.unwrap();
    let b = second.orchestrator.run(request).await.unwrap();

    assert_ne!(a.chain_id, b.chain_id);
    assert_eq!(a.predicted_state, b.predicted_state);
    assert_eq!(a.assessment, b.assessment);
    assert_eq!(a.verification, b.verification);

    let digests = |h: &Harness, chain_id: &str| -> Vec<String> {
        h.log
            .chain(chain_id)
            .into_iter()
            .map(|e| e.input_digest)
            .collect()
    };
    assert_eq!(digests(&first, &a.chain_id), digests(&second, &b.chain_id));
}

#[tokio::test(start_paused = true)]
async fn test_perception_failure_without_history_aborts() {
    let collaborators = Collaborators {
        perception: Arc::new(DownPerception),
        reasoner: Arc::new(MockReasoner::default()),
    };
    let h = harness(collaborators);

    let err = h
        .orchestrator
        .run(PipelineRequest::new(Action::Pass))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Aborted { stage: Stage::Perception, .. }));

    let entries = h.log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, EntryOutcome::Aborted);
    assert_eq!(h.metrics.snapshot().aborted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_perception_falls_back_to_last_known_state() {
    let state = governance_state();
    let collaborators = Collaborators {
        perception: Arc::new(FlakyPerception {
            calls: AtomicU32::new(0),
            state,
        }),
        reasoner: Arc::new(MockReasoner::default()),
    };
    let h = harness(collaborators);

    let first = h.orchestrator.run(PipelineRequest::new(Action::Pass)).await.unwrap();
    assert!(!first.is_degraded());

    let second = h.orchestrator.run(PipelineRequest::new(Action::Pass)).await.unwrap();
    assert_eq!(second.current_state, state);
    assert_eq!(second.degraded_stages, vec![Stage::Perception]);
    assert!(second.verification.comments.contains("degraded"));
}

#[tokio::test(start_paused = true)]
async fn test_reasoning_failure_uses_rules_and_opens_breaker() {
    let reasoner = Arc::new(GarbageReasoner::default());
    let collaborators = Collaborators {
        perception: Arc::new(MockPerception::new(7)),
        reasoner: reasoner.clone(),
    };
    let h = harness(collaborators);

    for _ in 0..5 {
        let response = h
            .orchestrator
            .run(PipelineRequest::new(Action::Pass).with_state(governance_state()))
            .await
            .unwrap();
        assert_eq!(response.degraded_stages, vec![Stage::Reasoning]);
        assert_eq!(response.assessment.confidence, FALLBACK_CONFIDENCE);
        assert!(response.prediction.is_some());
    }
    assert_eq!(reasoner.calls.load(Ordering::SeqCst), 5);
    assert_eq!(
        h.registry.breaker(REASONING_DEPENDENCY).state(),
        CircuitState::Open
    );

    // Breaker is open: the reasoner is not consulted, the fallback still answers
    let response = h
        .orchestrator
        .run(PipelineRequest::new(Action::Pass).with_state(governance_state()))
        .await
        .unwrap();
    assert_eq!(response.degraded_stages, vec![Stage::Reasoning]);
    assert_eq!(reasoner.calls.load(Ordering::SeqCst), 5);
    assert_eq!(h.metrics.fallbacks(Stage::Reasoning), 6);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_request_state_aborts() {
    let h = harness(mock_collaborators());
    let bad = MarketState {
        liquidity_depth: -1.0,
        volatility_index: 0.5,
        governance_risk_score: 0.2,
    };

    let err = h
        .orchestrator
        .run(PipelineRequest::new(Action::Pass).with_state(bad))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Stage::Perception);
    assert!(h.orchestrator.last_state().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_perception() {
    let collaborators = Collaborators {
        perception: Arc::new(SlowPerception),
        reasoner: Arc::new(MockReasoner::default()),
    };
    let h = harness(collaborators);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let request = h
        .orchestrator
        .run_with_cancel(PipelineRequest::new(Action::Pass), cancel_rx);
    let canceller = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel_tx.send(true).ok();
    };

    let (result, _) = tokio::join!(request, canceller);
    let err = result.unwrap_err();
    assert_eq!(err, PipelineError::Cancelled { stage: Stage::Perception });

    let entries = h.log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, EntryOutcome::Cancelled);
    assert_eq!(h.metrics.snapshot().cancelled, 1);
    assert_eq!(
        h.registry.breaker("perception").state(),
        CircuitState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_request_tracks_no_prediction() {
    let collaborators = Collaborators {
        perception: Arc::new(MockPerception::new(7)),
        reasoner: Arc::new(SlowReasoner),
    };
    let h = harness(collaborators);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let request = h.orchestrator.run_with_cancel(
        PipelineRequest::new(Action::Pass).with_state(governance_state()),
        cancel_rx,
    );
    let canceller = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel_tx.send(true).ok();
    };

    let (result, _) = tokio::join!(request, canceller);
    assert_eq!(
        result.unwrap_err(),
        PipelineError::Cancelled { stage: Stage::Reasoning }
    );

    // The forecast was produced but the request never completed
    let stages: Vec<Stage> = h.log.entries().iter().map(|e| e.stage).collect();
    assert_eq!(stages, vec![Stage::Perception, Stage::Prediction, Stage::Reasoning]);
    assert_eq!(h.tracker.pending_count(), 0);
    assert_eq!(h.metrics.snapshot().predictions_recorded, 0);
}

#[tokio::test(start_paused = true)]
async fn test_already_cancelled_request_never_starts() {
    let h = harness(mock_collaborators());
    let (_cancel_tx, cancel_rx) = watch::channel(true);

    let err = h
        .orchestrator
        .run_with_cancel(PipelineRequest::new(Action::Pass), cancel_rx)
        .await
        .unwrap_err();

    assert_eq!(err, PipelineError::Cancelled { stage: Stage::Perception });
    assert!(h.orchestrator.last_state().is_none());
    assert_eq!(h.metrics.snapshot().completed, 0);
}
