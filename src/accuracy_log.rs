//! Accuracy Log
//!
//! Append-only record of every resolved prediction, read back only as a
//! bounded recent window for accuracy statistics. Unresolved predictions are
//! kept alongside so they survive a restart.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::types::{Prediction, ResolvedSample};

/// Durable sink for resolved samples and pending predictions
pub trait AccuracyLog: Send + Sync {
    /// Append one sample and drop the matching pending prediction.
    /// A failure means nothing was recorded and the pending entry is kept.
    fn append(&self, sample: &ResolvedSample) -> Result<()>;

    /// Persist a prediction awaiting resolution
    fn record_pending(&self, prediction: &Prediction) -> Result<()>;

    /// Drop a pending prediction without resolving it
    fn remove_pending(&self, prediction_id: &str) -> Result<()>;

    /// Every pending prediction, earliest maturity first
    fn load_pending(&self) -> Result<Vec<Prediction>>;

    /// Whether a sample for this prediction was ever appended
    fn is_resolved(&self, prediction_id: &str) -> Result<bool>;

    /// The most recent `n` samples, oldest first
    fn recent(&self, n: usize) -> Result<Vec<ResolvedSample>>;

    /// Total samples recorded
    fn count(&self) -> Result<usize>;
}

/// Accuracy log with SQLite backend
pub struct SqliteAccuracyLog {
    conn: Mutex<Connection>,
}

impl SqliteAccuracyLog {
    /// Open or create the log database
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open accuracy log {}", path.display()))?;
        let log = Self::from_connection(conn)?;

        info!("Accuracy log opened: {}", path.display());
        Ok(log)
    }

    /// Non-persistent log, for tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS resolved_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                prediction_id TEXT NOT NULL UNIQUE,
                payload TEXT NOT NULL,
                absolute_error REAL NOT NULL,
                signed_error REAL NOT NULL,
                resolved_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_resolved_samples_resolved_at
                ON resolved_samples(resolved_at);

            CREATE TABLE IF NOT EXISTS pending_predictions (
                prediction_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                maturity_at TEXT NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl AccuracyLog for SqliteAccuracyLog {
    fn append(&self, sample: &ResolvedSample) -> Result<()> {
        let payload = serde_json::to_string(sample)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO resolved_samples (prediction_id, payload, absolute_error, signed_error, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sample.prediction.id,
                payload,
                sample.absolute_error,
                sample.signed_error,
                sample.resolved_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to append sample {}", sample.prediction.id))?;
        tx.execute(
            "DELETE FROM pending_predictions WHERE prediction_id = ?1",
            params![sample.prediction.id],
        )?;
        tx.commit()
            .with_context(|| format!("Failed to commit sample {}", sample.prediction.id))?;

        debug!("Logged resolved sample {}", sample.prediction.id);
        Ok(())
    }

    fn record_pending(&self, prediction: &Prediction) -> Result<()> {
        let payload = serde_json::to_string(prediction)?;

        self.conn
            .lock()
            .execute(
                "INSERT INTO pending_predictions (prediction_id, payload, maturity_at)
                 VALUES (?1, ?2, ?3)",
                params![prediction.id, payload, prediction.maturity_at.to_rfc3339()],
            )
            .with_context(|| format!("Failed to persist prediction {}", prediction.id))?;
        Ok(())
    }

    fn remove_pending(&self, prediction_id: &str) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM pending_predictions WHERE prediction_id = ?1",
            params![prediction_id],
        )?;
        Ok(())
    }

    fn load_pending(&self) -> Result<Vec<Prediction>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT payload FROM pending_predictions ORDER BY maturity_at ASC")?;

        let payloads = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        payloads
            .iter()
            .map(|p| serde_json::from_str::<Prediction>(p).context("Corrupt pending prediction payload"))
            .collect()
    }

    fn is_resolved(&self, prediction_id: &str) -> Result<bool> {
        let found: bool = self.conn.lock().query_row(
            "SELECT EXISTS(SELECT 1 FROM resolved_samples WHERE prediction_id = ?1)",
            params![prediction_id],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    fn recent(&self, n: usize) -> Result<Vec<ResolvedSample>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT payload FROM resolved_samples
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let payloads = stmt
            .query_map(params![n as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        // Reverse to get chronological order
        payloads
            .iter()
            .rev()
            .map(|p| serde_json::from_str::<ResolvedSample>(p).context("Corrupt accuracy log payload"))
            .collect()
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM resolved_samples", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Accuracy log kept in process memory
#[derive(Default)]
pub struct MemoryAccuracyLog {
    samples: Mutex<Vec<ResolvedSample>>,
    pending: Mutex<HashMap<String, Prediction>>,
}

impl MemoryAccuracyLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccuracyLog for MemoryAccuracyLog {
    fn append(&self, sample: &ResolvedSample) -> Result<()> {
        let mut samples = self.samples.lock();
        if samples.iter().any(|s| s.prediction.id == sample.prediction.id) {
            bail!("Sample {} already logged", sample.prediction.id);
        }
        samples.push(sample.clone());
        self.pending.lock().remove(&sample.prediction.id);
        Ok(())
    }

    fn record_pending(&self, prediction: &Prediction) -> Result<()> {
        self.pending
            .lock()
            .insert(prediction.id.clone(), prediction.clone());
        Ok(())
    }

    fn remove_pending(&self, prediction_id: &str) -> Result<()> {
        self.pending.lock().remove(prediction_id);
        Ok(())
    }

    fn load_pending(&self) -> Result<Vec<Prediction>> {
        let mut pending: Vec<Prediction> = self.pending.lock().values().cloned().collect();
        pending.sort_by_key(|p| p.maturity_at);
        Ok(pending)
    }

    fn is_resolved(&self, prediction_id: &str) -> Result<bool> {
        Ok(self
            .samples
            .lock()
            .iter()
            .any(|s| s.prediction.id == prediction_id))
    }

    fn recent(&self, n: usize) -> Result<Vec<ResolvedSample>> {
        let samples = self.samples.lock();
        let start = samples.len().saturating_sub(n);
        Ok(samples[start..].to_vec())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.samples.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, MarketState, Prediction};
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample(predicted: f64, actual: f64) -> ResolvedSample {
        let input = MarketState::new(10_000_000.0, 0.5, 0.2).unwrap();
        let predicted = MarketState::new(predicted, 0.5, 0.2).unwrap();
        let actual = MarketState::new(actual, 0.5, 0.2).unwrap();
        ResolvedSample::new(Prediction::new(input, Action::Pass, predicted, 0.7), actual, Utc::now())
    }

    #[test]
    fn test_sqlite_recent_window_in_order() {
        let temp = TempDir::new().unwrap();
        let log = SqliteAccuracyLog::open(&temp.path().join("nested/accuracy.db")).unwrap();

        for i in 0..5 {
            log.append(&sample(9_000_000.0 + i as f64, 9_000_000.0)).unwrap();
        }

        let recent = log.recent(3).unwrap();
        let errors: Vec<f64> = recent.iter().map(|s| s.signed_error).collect();
        assert_eq!(errors, vec![2.0, 3.0, 4.0]);
        assert_eq!(log.count().unwrap(), 5);
    }

    #[test]
    fn test_sqlite_rejects_duplicate_prediction() {
        let log = SqliteAccuracyLog::open_in_memory().unwrap();
        let s = sample(9_000_000.0, 9_100_000.0);

        log.append(&s).unwrap();
        assert!(log.append(&s).is_err());
        assert_eq!(log.count().unwrap(), 1);
    }

    #[test]
    fn test_sqlite_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("accuracy.db");
        let s = sample(9_000_000.0, 9_100_000.0);

        {
            let log = SqliteAccuracyLog::open(&path).unwrap();
            log.append(&s).unwrap();
        }

        let log = SqliteAccuracyLog::open(&path).unwrap();
        let recent = log.recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].prediction.id, s.prediction.id);
    }

    #[test]
    fn test_sqlite_pending_cleared_by_append() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("accuracy.db");
        let s = sample(9_000_000.0, 9_100_000.0);

        {
            let log = SqliteAccuracyLog::open(&path).unwrap();
            log.record_pending(&s.prediction).unwrap();
        }

        let log = SqliteAccuracyLog::open(&path).unwrap();
        let pending = log.load_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, s.prediction.id);
        assert!(!log.is_resolved(&s.prediction.id).unwrap());

        log.append(&s).unwrap();
        assert!(log.load_pending().unwrap().is_empty());
        assert!(log.is_resolved(&s.prediction.id).unwrap());
    }

    #[test]
    fn test_sqlite_failed_append_keeps_pending() {
        let log = SqliteAccuracyLog::open_in_memory().unwrap();
        let s = sample(9_000_000.0, 9_100_000.0);
        log.append(&s).unwrap();

        // Re-pending a resolved id, then a duplicate append rolls back whole
        log.record_pending(&s.prediction).unwrap();
        assert!(log.append(&s).is_err());
        assert_eq!(log.load_pending().unwrap().len(), 1);

        log.remove_pending(&s.prediction.id).unwrap();
        assert!(log.load_pending().unwrap().is_empty());
    }

    #[test]
    fn test_memory_log_window() {
        let log = MemoryAccuracyLog::new();
        for i in 0..4 {
            log.append(&sample(1_000.0 * i as f64, 0.0)).unwrap();
        }

        assert_eq!(log.recent(10).unwrap().len(), 4);
        assert_eq!(log.recent(2).unwrap()[0].signed_error, 2_000.0);
    }
}
