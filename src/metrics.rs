//! Pipeline Metrics
//!
//! Request outcomes, per-stage fallback counts and end-to-end latency.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::pipeline::Stage;

const STAGES: [Stage; 4] = [
    Stage::Perception,
    Stage::Prediction,
    Stage::Reasoning,
    Stage::Validation,
];

fn stage_index(stage: Stage) -> usize {
    match stage {
        Stage::Perception => 0,
        Stage::Prediction => 1,
        Stage::Reasoning => 2,
        Stage::Validation => 3,
    }
}

/// Latency percentiles
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
    pub min_ms: u64,
}

/// Point-in-time counter values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub completed: u64,
    pub degraded: u64,
    pub aborted: u64,
    pub cancelled: u64,
    pub predictions_recorded: u64,
    pub fallbacks: BTreeMap<Stage, u64>,
}

impl MetricsSnapshot {
    /// Share of completed requests that needed no fallback
    pub fn healthy_rate(&self) -> f64 {
        if self.completed == 0 {
            1.0
        } else {
            (self.completed - self.degraded.min(self.completed)) as f64 / self.completed as f64
        }
    }

    /// Format for display
    pub fn format(&self) -> String {
        format!(
            "{} requests: {} completed ({} degraded, {:.1}% healthy), {} aborted, {} cancelled, {} predictions tracked",
            self.requests,
            self.completed,
            self.degraded,
            self.healthy_rate() * 100.0,
            self.aborted,
            self.cancelled,
            self.predictions_recorded
        )
    }
}

/// Real-time pipeline metrics collector
pub struct PipelineMetrics {
    requests: AtomicU64,
    completed: AtomicU64,
    degraded: AtomicU64,
    aborted: AtomicU64,
    cancelled: AtomicU64,
    predictions_recorded: AtomicU64,
    fallbacks: [AtomicU64; 4],
    /// Latency history (rolling window)
    latencies: RwLock<Vec<u64>>,
    max_history: usize,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl PipelineMetrics {
    pub fn new(max_history: usize) -> Self {
        Self {
            requests: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            predictions_recorded: AtomicU64::new(0),
            fallbacks: Default::default(),
            latencies: RwLock::new(Vec::with_capacity(max_history.min(4096))),
            max_history: max_history.max(1),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, latency: Duration, degraded: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if degraded {
            self.degraded.fetch_add(1, Ordering::Relaxed);
        }

        let mut latencies = self.latencies.write();
        latencies.push(latency.as_millis() as u64);
        // Trim if over capacity
        if latencies.len() > self.max_history {
            let drain_count = latencies.len() - self.max_history;
            latencies.drain(0..drain_count);
        }
        debug!(latency_ms = latency.as_millis() as u64, degraded, "Recorded completed request");
    }

    pub fn record_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self, stage: Stage) {
        self.fallbacks[stage_index(stage)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prediction(&self) {
        self.predictions_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fallbacks(&self, stage: Stage) -> u64 {
        self.fallbacks[stage_index(stage)].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            predictions_recorded: self.predictions_recorded.load(Ordering::Relaxed),
            fallbacks: STAGES
                .iter()
                .map(|&s| (s, self.fallbacks(s)))
                .filter(|(_, n)| *n > 0)
                .collect(),
        }
    }

    /// Get latency statistics
    pub fn latency_stats(&self) -> LatencyStats {
        let mut latencies = self.latencies.read().clone();
        if latencies.is_empty() {
            return LatencyStats::default();
        }
        latencies.sort_unstable();

        let len = latencies.len();
        let p50_idx = len / 2;
        let p90_idx = len * 90 / 100;
        let p99_idx = len * 99 / 100;

        LatencyStats {
            p50_ms: latencies.get(p50_idx).copied().unwrap_or(0),
            p90_ms: latencies.get(p90_idx).copied().unwrap_or(0),
            p99_ms: latencies.get(p99_idx).copied().unwrap_or(0),
            max_ms: latencies.last().copied().unwrap_or(0),
            min_ms: latencies.first().copied().unwrap_or(0),
        }
    }
}
