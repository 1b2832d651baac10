//! Prediction Tracker
//!
//! Closes the feedback loop: every recorded prediction waits until its
//! maturity deadline, is resolved exactly once against observed ground truth,
//! and the resulting sample is persisted and handed to the replay buffer.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::accuracy_log::AccuracyLog;
use crate::model::ReplayBuffer;
use crate::types::{MarketState, Prediction, ResolvedSample};

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("unknown prediction '{0}'")]
    UnknownPrediction(String),

    #[error("prediction '{id}' is not mature until {maturity_at}")]
    NotYetMature {
        id: String,
        maturity_at: DateTime<Utc>,
    },

    #[error("prediction '{0}' was already resolved")]
    AlreadyResolved(String),

    #[error("prediction '{0}' is already being tracked")]
    DuplicatePrediction(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Error statistics over a window of resolved samples
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccuracyStats {
    pub count: usize,
    /// Mean absolute error on liquidity depth
    pub mae: f64,
    /// Root mean squared error on liquidity depth
    pub rmse: f64,
    /// Mean of `1 - |error| / actual`, clamped per sample, as a percentage
    pub accuracy_pct: f64,
    /// Mean signed error (positive = over-prediction)
    pub bias: f64,
}

impl AccuracyStats {
    pub fn from_samples(samples: &[ResolvedSample]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let n = samples.len() as f64;
        let mae = samples.iter().map(|s| s.absolute_error).sum::<f64>() / n;
        let mse = samples.iter().map(|s| s.signed_error * s.signed_error).sum::<f64>() / n;
        let accuracy = samples.iter().map(|s| s.accuracy()).sum::<f64>() / n;
        let bias = samples.iter().map(|s| s.signed_error).sum::<f64>() / n;

        Some(Self {
            count: samples.len(),
            mae,
            rmse: mse.sqrt(),
            accuracy_pct: accuracy * 100.0,
            bias,
        })
    }
}

/// Resolved ids remembered in memory. Older ids are looked up in the log.
pub const DEFAULT_RESOLVED_WINDOW: usize = 10_000;

#[derive(Default)]
struct TrackerState {
    pending: HashMap<String, Prediction>,
    /// Removed from `pending`, sample not yet persisted
    resolving: HashSet<String>,
    resolved: HashSet<String>,
    resolved_order: VecDeque<String>,
}

impl TrackerState {
    fn is_known(&self, id: &str) -> bool {
        self.pending.contains_key(id) || self.resolving.contains(id) || self.resolved.contains(id)
    }

    fn mark_resolved(&mut self, id: String, window: usize) {
        if !self.resolved.insert(id.clone()) {
            return;
        }
        self.resolved_order.push_back(id);
        while self.resolved_order.len() > window {
            if let Some(evicted) = self.resolved_order.pop_front() {
                self.resolved.remove(&evicted);
            }
        }
    }
}

pub struct PredictionTracker {
    resolution_delay: Duration,
    resolved_window: usize,
    state: Mutex<TrackerState>,
    buffer: Arc<ReplayBuffer>,
    log: Arc<dyn AccuracyLog>,
}

impl PredictionTracker {
    pub fn new(
        resolution_delay: std::time::Duration,
        buffer: Arc<ReplayBuffer>,
        log: Arc<dyn AccuracyLog>,
    ) -> Self {
        Self {
            resolution_delay: Duration::from_std(resolution_delay).unwrap_or(Duration::MAX),
            resolved_window: DEFAULT_RESOLVED_WINDOW,
            state: Mutex::new(TrackerState::default()),
            buffer,
            log,
        }
    }

    /// Cap on resolved ids held in memory (at least one)
    pub fn with_resolved_window(mut self, window: usize) -> Self {
        self.resolved_window = window.max(1);
        self
    }

    pub fn resolution_delay(&self) -> Duration {
        self.resolution_delay
    }

    /// Seed the replay buffer from the persisted log and restore pending
    /// predictions. Returns the number of samples loaded.
    pub fn warm_start(&self, limit: usize) -> Result<usize, TrackerError> {
        let samples = self.log.recent(limit)?;
        let pending = self.log.load_pending()?;
        let count = samples.len();
        let mut restored = 0;
        {
            let mut state = self.state.lock();
            for sample in &samples {
                state.mark_resolved(sample.prediction.id.clone(), self.resolved_window);
            }
            for prediction in pending {
                if state.is_known(&prediction.id) {
                    continue;
                }
                if self.log.is_resolved(&prediction.id)? {
                    self.log.remove_pending(&prediction.id)?;
                    continue;
                }
                state.pending.insert(prediction.id.clone(), prediction);
                restored += 1;
            }
        }
        for sample in samples {
            self.buffer.add(sample);
        }
        if count > 0 || restored > 0 {
            info!(
                samples = count,
                pending = restored,
                "Tracker warm-started from accuracy log"
            );
        }
        Ok(count)
    }

    /// Start tracking a prediction. Maturity is `created_at + resolution_delay`.
    /// The prediction is persisted before it counts as pending.
    pub fn record(&self, mut prediction: Prediction) -> Result<Prediction, TrackerError> {
        prediction.maturity_at = prediction
            .created_at
            .checked_add_signed(self.resolution_delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut state = self.state.lock();
        if state.is_known(&prediction.id) || self.log.is_resolved(&prediction.id)? {
            return Err(TrackerError::DuplicatePrediction(prediction.id));
        }
        if let Err(e) = self.log.record_pending(&prediction) {
            error!(id = %prediction.id, "Failed to persist prediction: {:#}", e);
            return Err(TrackerError::Storage(e));
        }
        state.pending.insert(prediction.id.clone(), prediction.clone());

        debug!(id = %prediction.id, maturity_at = %prediction.maturity_at, "Prediction recorded");
        Ok(prediction)
    }

    pub fn resolve(&self, id: &str, actual: MarketState) -> Result<ResolvedSample, TrackerError> {
        self.resolve_at(id, actual, Utc::now())
    }

    /// Resolve against ground truth observed at `now`.
    ///
    /// Exactly once per id. An early call fails with `NotYetMature` and leaves
    /// the prediction pending; a storage failure rolls the resolution back.
    pub fn resolve_at(
        &self,
        id: &str,
        actual: MarketState,
        now: DateTime<Utc>,
    ) -> Result<ResolvedSample, TrackerError> {
        let prediction = {
            let mut state = self.state.lock();
            if state.resolving.contains(id) || state.resolved.contains(id) {
                return Err(TrackerError::AlreadyResolved(id.to_string()));
            }
            let Some(maturity_at) = state.pending.get(id).map(|p| p.maturity_at) else {
                drop(state);
                // Resolved before the in-memory window
                if self.log.is_resolved(id)? {
                    return Err(TrackerError::AlreadyResolved(id.to_string()));
                }
                return Err(TrackerError::UnknownPrediction(id.to_string()));
            };
            if now < maturity_at {
                return Err(TrackerError::NotYetMature {
                    id: id.to_string(),
                    maturity_at,
                });
            }
            state.resolving.insert(id.to_string());
            match state.pending.remove(id) {
                Some(p) => p,
                None => return Err(TrackerError::UnknownPrediction(id.to_string())),
            }
        };

        let sample = ResolvedSample::new(prediction, actual, now);

        // Appending also clears the persisted pending entry
        if let Err(e) = self.log.append(&sample) {
            error!(id, "Failed to persist resolved sample: {:#}", e);
            let mut state = self.state.lock();
            state.resolving.remove(id);
            state.pending.insert(id.to_string(), sample.prediction);
            return Err(TrackerError::Storage(e));
        }

        {
            let mut state = self.state.lock();
            state.resolving.remove(id);
            state.mark_resolved(id.to_string(), self.resolved_window);
        }
        self.buffer.add(sample.clone());

        info!(
            id,
            absolute_error = sample.absolute_error,
            accuracy = sample.accuracy(),
            "Prediction resolved"
        );
        Ok(sample)
    }

    /// Statistics over the most recent `window` resolved samples
    pub fn accuracy_stats(&self, window: usize) -> Result<Option<AccuracyStats>, TrackerError> {
        let samples = self.log.recent(window)?;
        Ok(AccuracyStats::from_samples(&samples))
    }

    /// Matured, unresolved predictions, oldest deadline first
    pub fn pending_due(&self, now: DateTime<Utc>) -> Vec<Prediction> {
        let state = self.state.lock();
        let mut due: Vec<Prediction> = state
            .pending
            .values()
            .filter(|p| p.maturity_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|p| p.maturity_at);
        due
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}
