//! Prediction Tracker Integration Tests
//!
//! Resolution lifecycle, accuracy statistics and persistence through the
//! SQLite accuracy log.

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use senseforge::accuracy_log::{AccuracyLog, MemoryAccuracyLog, SqliteAccuracyLog};
use senseforge::model::ReplayBuffer;
use senseforge::tracker::{PredictionTracker, TrackerError};
use senseforge::types::{Action, MarketState, Prediction, ResolvedSample};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DELAY: Duration = Duration::from_secs(300);

fn state(liquidity: f64) -> MarketState {
    MarketState::new(liquidity, 0.5, 0.2).unwrap()
}

fn prediction(predicted_liquidity: f64) -> Prediction {
    Prediction::new(state(10_000_000.0), Action::Pass, state(predicted_liquidity), 0.7)
}

fn memory_tracker() -> (PredictionTracker, Arc<ReplayBuffer>) {
    let buffer = Arc::new(ReplayBuffer::new(100));
    let tracker = PredictionTracker::new(DELAY, buffer.clone(), Arc::new(MemoryAccuracyLog::new()));
    (tracker, buffer)
}

/// Accuracy log whose writes can be switched off
struct UnreliableLog {
    failing: AtomicBool,
    inner: MemoryAccuracyLog,
}

impl AccuracyLog for UnreliableLog {
    fn append(&self, sample: &ResolvedSample) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.append(sample)
    }

    fn record_pending(&self, prediction: &Prediction) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.record_pending(prediction)
    }

    fn remove_pending(&self, prediction_id: &str) -> anyhow::Result<()> {
        self.inner.remove_pending(prediction_id)
    }

    fn load_pending(&self) -> anyhow::Result<Vec<Prediction>> {
        self.inner.load_pending()
    }

    fn is_resolved(&self, prediction_id: &str) -> anyhow::Result<bool> {
        self.inner.is_resolved(prediction_id)
    }

    fn recent(&self, n: usize) -> anyhow::Result<Vec<ResolvedSample>> {
        self.inner.recent(n)
    }

    fn count(&self) -> anyhow::Result<usize> {
        self.inner.count()
    }
}

#[test]
fn test_resolution_lifecycle() {
    let (tracker, buffer) = memory_tracker();
    let recorded = tracker.record(prediction(9_000_000.0)).unwrap();
    assert_eq!(
        recorded.maturity_at,
        recorded.created_at + ChronoDuration::seconds(300)
    );

    // Too early: hard failure, still pending
    let early = tracker.resolve_at(&recorded.id, state(9_500_000.0), recorded.created_at);
    assert!(matches!(early, Err(TrackerError::NotYetMature { .. })));
    assert_eq!(tracker.pending_count(), 1);

    let sample = tracker
        .resolve_at(&recorded.id, state(9_500_000.0), recorded.maturity_at)
        .unwrap();
    assert_eq!(sample.signed_error, -500_000.0);
    assert_eq!(sample.absolute_error, 500_000.0);
    assert_eq!(tracker.pending_count(), 0);
    assert_eq!(buffer.len(), 1);

    // Exactly once
    let again = tracker.resolve_at(&recorded.id, state(9_500_000.0), recorded.maturity_at);
    assert!(matches!(again, Err(TrackerError::AlreadyResolved(_))));
    assert_eq!(buffer.len(), 1);
}

#[test]
fn test_unknown_and_duplicate_predictions() {
    let (tracker, _) = memory_tracker();

    let unknown = tracker.resolve("pred_missing", state(1.0));
    assert!(matches!(unknown, Err(TrackerError::UnknownPrediction(_))));

    let recorded = tracker.record(prediction(9_000_000.0)).unwrap();
    let duplicate = tracker.record(recorded.clone());
    assert!(matches!(duplicate, Err(TrackerError::DuplicatePrediction(_))));
}

#[test]
fn test_accuracy_stats_match_direct_computation() {
    let (tracker, _) = memory_tracker();
    let cases = [
        (9_000_000.0, 9_500_000.0),
        (10_000_000.0, 9_800_000.0),
        (8_000_000.0, 8_000_000.0),
    ];

    let past = Utc::now() - ChronoDuration::hours(1);
    for (predicted, actual) in cases {
        let recorded = tracker
            .record(prediction(predicted).created_at(past))
            .unwrap();
        tracker.resolve(&recorded.id, state(actual)).unwrap();
    }

    let stats = tracker.accuracy_stats(10).unwrap().unwrap();
    let errors: Vec<f64> = cases.iter().map(|(p, a)| p - a).collect();
    let mae = errors.iter().map(|e| e.abs()).sum::<f64>() / 3.0;
    let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / 3.0).sqrt();

    assert_eq!(stats.count, 3);
    assert!((stats.mae - mae).abs() < 1e-6);
    assert!((stats.rmse - rmse).abs() < 1e-6);
    assert!(stats.accuracy_pct > 90.0 && stats.accuracy_pct <= 100.0);

    // Window limits the sample set
    assert_eq!(tracker.accuracy_stats(1).unwrap().unwrap().count, 1);
}

#[test]
fn test_no_stats_before_resolution() {
    let (tracker, _) = memory_tracker();
    tracker.record(prediction(9_000_000.0)).unwrap();
    assert!(tracker.accuracy_stats(10).unwrap().is_none());
}

#[test]
fn test_pending_due_lists_matured_only() {
    let (tracker, _) = memory_tracker();
    let now = Utc::now();
    let old = tracker
        .record(prediction(9_000_000.0).created_at(now - ChronoDuration::hours(1)))
        .unwrap();
    tracker.record(prediction(9_100_000.0).created_at(now)).unwrap();

    let due = tracker.pending_due(now);
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, old.id);
}

#[test]
fn test_storage_failure_rolls_back() {
    let log = Arc::new(UnreliableLog {
        failing: AtomicBool::new(false),
        inner: MemoryAccuracyLog::new(),
    });
    let buffer = Arc::new(ReplayBuffer::new(100));
    let tracker = PredictionTracker::new(DELAY, buffer.clone(), log.clone());

    let recorded = tracker.record(prediction(9_000_000.0)).unwrap();
    log.failing.store(true, Ordering::SeqCst);
    let result = tracker.resolve_at(&recorded.id, state(9_500_000.0), recorded.maturity_at);
    assert!(matches!(result, Err(TrackerError::Storage(_))));
    assert_eq!(tracker.pending_count(), 1);
    assert!(buffer.is_empty());

    // Storage back: the same prediction resolves normally
    log.failing.store(false, Ordering::SeqCst);
    tracker
        .resolve_at(&recorded.id, state(9_500_000.0), recorded.maturity_at)
        .unwrap();
    assert_eq!(log.count().unwrap(), 1);
    assert_eq!(buffer.len(), 1);
}

#[test]
fn test_sqlite_log_survives_restart() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp.path().join("accuracy.db");
    let past = Utc::now() - ChronoDuration::hours(1);

    let resolved_id = {
        let log = Arc::new(SqliteAccuracyLog::open(&db_path).unwrap());
        let tracker = PredictionTracker::new(DELAY, Arc::new(ReplayBuffer::new(100)), log);
        let recorded = tracker
            .record(prediction(9_000_000.0).created_at(past))
            .unwrap();
        tracker.resolve(&recorded.id, state(9_400_000.0)).unwrap();
        recorded.id
    };

    let log = Arc::new(SqliteAccuracyLog::open(&db_path).unwrap());
    let buffer = Arc::new(ReplayBuffer::new(100));
    let tracker = PredictionTracker::new(DELAY, buffer.clone(), log);

    assert_eq!(tracker.warm_start(100).unwrap(), 1);
    assert_eq!(buffer.len(), 1);
    assert_eq!(tracker.accuracy_stats(10).unwrap().unwrap().mae, 400_000.0);

    // Warm-started ids count as resolved
    let again = tracker.resolve(&resolved_id, state(9_400_000.0));
    assert!(matches!(again, Err(TrackerError::AlreadyResolved(_))));
}

#[test]
fn test_unpersisted_prediction_is_not_tracked() {
    let log = Arc::new(UnreliableLog {
        failing: AtomicBool::new(true),
        inner: MemoryAccuracyLog::new(),
    });
    let tracker = PredictionTracker::new(DELAY, Arc::new(ReplayBuffer::new(100)), log.clone());

    let result = tracker.record(prediction(9_000_000.0));
    assert!(matches!(result, Err(TrackerError::Storage(_))));
    assert_eq!(tracker.pending_count(), 0);
    assert!(log.load_pending().unwrap().is_empty());
}

#[test]
fn test_pending_predictions_survive_restart() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp.path().join("accuracy.db");
    let past = Utc::now() - ChronoDuration::hours(1);

    let (matured_id, fresh_id) = {
        let log = Arc::new(SqliteAccuracyLog::open(&db_path).unwrap());
        let tracker = PredictionTracker::new(DELAY, Arc::new(ReplayBuffer::new(100)), log);
        let matured = tracker
            .record(prediction(9_000_000.0).created_at(past))
            .unwrap();
        let fresh = tracker.record(prediction(9_200_000.0)).unwrap();
        (matured.id, fresh.id)
    };

    let log = Arc::new(SqliteAccuracyLog::open(&db_path).unwrap());
    let buffer = Arc::new(ReplayBuffer::new(100));
    let tracker = PredictionTracker::new(DELAY, buffer.clone(), log.clone());

    assert_eq!(tracker.warm_start(100).unwrap(), 0);
    assert_eq!(tracker.pending_count(), 2);

    let due = tracker.pending_due(Utc::now());
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, matured_id);

    let sample = tracker.resolve(&matured_id, state(9_400_000.0)).unwrap();
    assert_eq!(sample.absolute_error, 400_000.0);
    assert_eq!(buffer.len(), 1);

    // Only the unresolved prediction is still persisted
    let persisted = log.load_pending().unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].id, fresh_id);

    let recorded = tracker.record(prediction(9_000_000.0).created_at(past));
    assert!(recorded.is_ok());
    assert!(matches!(
        tracker.record(due[0].clone()),
        Err(TrackerError::DuplicatePrediction(_))
    ));
}

#[test]
fn test_concurrent_resolution_is_exactly_once() {
    let (tracker, buffer) = memory_tracker();
    let tracker = Arc::new(tracker);
    let recorded = tracker
        .record(prediction(9_000_000.0).created_at(Utc::now() - ChronoDuration::hours(1)))
        .unwrap();
    let successes = Arc::new(Mutex::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let tracker = tracker.clone();
            let successes = successes.clone();
            let id = recorded.id.clone();
            std::thread::spawn(move || {
                if tracker.resolve(&id, state(9_500_000.0)).is_ok() {
                    *successes.lock() += 1;
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*successes.lock(), 1);
    assert_eq!(buffer.len(), 1);
}
