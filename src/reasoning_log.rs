//! Reasoning Trail
//!
//! One structured entry per stage transition, fallback or abort. Sinks never
//! fail from the pipeline's point of view: a sink that cannot write logs the
//! problem and drops the entry.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::pipeline::Stage;

/// What happened at a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryOutcome {
    /// Primary path succeeded
    Success,
    /// Deterministic fallback was used
    Fallback,
    /// Stage failed with no fallback; request aborted
    Aborted,
    /// Request was cancelled before the stage completed
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningEntry {
    pub chain_id: String,
    pub step: u32,
    pub stage: Stage,
    /// SHA-256 of the canonical JSON stage input
    pub input_digest: String,
    pub outcome: EntryOutcome,
    pub reason: Option<String>,
    pub confidence: f64,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Hex SHA-256 of a value's JSON encoding
pub fn digest<T: Serialize + ?Sized>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Append-only sink for reasoning entries
pub trait ReasoningLog: Send + Sync {
    fn append(&self, entry: ReasoningEntry);
}

/// Counts over a set of entries
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogSummary {
    pub chains: usize,
    pub entries: usize,
    pub fallbacks: usize,
    pub aborted: usize,
    pub per_stage: BTreeMap<Stage, usize>,
}

/// In-memory trail
#[derive(Default)]
pub struct MemoryReasoningLog {
    entries: Mutex<Vec<ReasoningEntry>>,
}

impl MemoryReasoningLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ReasoningEntry> {
        self.entries.lock().clone()
    }

    /// Entries belonging to one request, in step order
    pub fn chain(&self, chain_id: &str) -> Vec<ReasoningEntry> {
        let mut chain: Vec<ReasoningEntry> = self
            .entries
            .lock()
            .iter()
            .filter(|e| e.chain_id == chain_id)
            .cloned()
            .collect();
        chain.sort_by_key(|e| e.step);
        chain
    }

    pub fn summary(&self) -> LogSummary {
        let entries = self.entries.lock();
        let mut summary = LogSummary {
            entries: entries.len(),
            ..Default::default()
        };
        let mut chains = HashSet::new();

        for entry in entries.iter() {
            chains.insert(entry.chain_id.as_str());
            *summary.per_stage.entry(entry.stage).or_default() += 1;
            match entry.outcome {
                EntryOutcome::Fallback => summary.fallbacks += 1,
                EntryOutcome::Aborted => summary.aborted += 1,
                _ => {}
            }
        }
        summary.chains = chains.len();
        summary
    }
}

impl ReasoningLog for MemoryReasoningLog {
    fn append(&self, entry: ReasoningEntry) {
        self.entries.lock().push(entry);
    }
}

/// JSON-lines file trail
pub struct JsonlReasoningLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlReasoningLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open reasoning log {}", path.display()))?;

        info!("Reasoning log opened: {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a trail back, skipping unparsable lines
    pub fn read_all(path: &Path) -> Result<Vec<ReasoningEntry>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read reasoning log {}", path.display()))?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

impl ReasoningLog for JsonlReasoningLog {
    fn append(&self, entry: ReasoningEntry) {
        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize reasoning entry: {}", e);
                return;
            }
        };
        line.push('\n');

        let mut file = self.file.lock();
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(path = %self.path.display(), "Failed to write reasoning entry: {}", e);
        }
    }
}
