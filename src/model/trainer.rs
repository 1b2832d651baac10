//! Background Training Loop
//!
//! Periodically samples the replay buffer and trains the predictive model:
//! - Epochs of `num_batches` mini-batches of `batch_size`
//! - Loss history and improvement tracking
//! - Optional checkpointing every N epochs and on shutdown
//!
//! The buffer lock is held only while sampling, never across a gradient step.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::{PredictiveModel, ReplayBuffer, ReplayError};

/// Configuration for background training
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub num_batches: usize,
    /// Interval between epochs
    pub interval: Duration,
    /// Seed for batch sampling
    pub seed: u64,
    /// Where to write checkpoints, if anywhere
    pub checkpoint_dir: Option<PathBuf>,
    /// Epochs between checkpoints (0 = only on shutdown)
    pub checkpoint_every: u64,
    pub enabled: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            num_batches: 10,
            interval: Duration::from_secs(300), // 5 minutes
            seed: 7,
            checkpoint_dir: None,
            checkpoint_every: 10,
            enabled: true,
        }
    }
}

/// Summary of training progress
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingStats {
    pub epochs: u64,
    pub skipped: u64,
    pub initial_loss: Option<f64>,
    pub current_loss: Option<f64>,
    /// Percentage drop from the first to the latest epoch loss
    pub improvement_pct: Option<f64>,
}

pub struct Trainer {
    config: TrainerConfig,
    model: Arc<PredictiveModel>,
    buffer: Arc<ReplayBuffer>,
    rng: Mutex<StdRng>,
    epoch_losses: Mutex<Vec<f64>>,
    skipped: AtomicU64,
    running: AtomicBool,
}

impl Trainer {
    pub fn new(config: TrainerConfig, model: Arc<PredictiveModel>, buffer: Arc<ReplayBuffer>) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            config,
            model,
            buffer,
            epoch_losses: Mutex::new(Vec::new()),
            skipped: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one epoch and return its mean batch loss
    pub fn train_epoch(&self) -> Result<f64, ReplayError> {
        let batches = self.config.num_batches.max(1);
        let mut total = 0.0;

        for _ in 0..batches {
            let batch = {
                let mut rng = self.rng.lock();
                self.buffer.sample_with(self.config.batch_size, &mut *rng)?
            };
            total += self.model.train_on_batch(&batch);
        }

        let loss = total / batches as f64;
        let epoch = {
            let mut losses = self.epoch_losses.lock();
            losses.push(loss);
            losses.len()
        };
        info!(epoch, loss, buffer = self.buffer.len(), "Training epoch complete");
        Ok(loss)
    }

    pub fn training_stats(&self) -> TrainingStats {
        let losses = self.epoch_losses.lock();
        let initial_loss = losses.first().copied();
        let current_loss = losses.last().copied();
        let improvement_pct = match (initial_loss, current_loss) {
            (Some(first), Some(last)) if first > 0.0 => Some((first - last) / first * 100.0),
            _ => None,
        };

        TrainingStats {
            epochs: losses.len() as u64,
            skipped: self.skipped.load(Ordering::Relaxed),
            initial_loss,
            current_loss,
            improvement_pct,
        }
    }

    /// One scheduled tick: train if enough data, checkpoint when due
    pub fn run_once(&self) -> Option<f64> {
        self.running.store(true, Ordering::SeqCst);
        let result = match self.train_epoch() {
            Ok(loss) => {
                let epochs = self.epoch_losses.lock().len() as u64;
                if self.config.checkpoint_every > 0 && epochs % self.config.checkpoint_every == 0 {
                    self.checkpoint();
                }
                Some(loss)
            }
            Err(e) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                debug!("Skipping training epoch: {}", e);
                None
            }
        };
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Start continuous training loop
    pub async fn run_continuous(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Background training disabled");
            return;
        }

        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting background training"
        );
        let mut ticker = interval(self.config.interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once();
                }
                changed = shutdown.changed() => {
                    // Sender gone counts as shutdown
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Background training shutting down");
                        break;
                    }
                }
            }
        }

        if self.training_stats().epochs > 0 {
            self.checkpoint();
        }
    }

    fn checkpoint(&self) {
        let Some(dir) = &self.config.checkpoint_dir else {
            return;
        };
        if let Err(e) = self.model.save_checkpoint(dir, None) {
            warn!("Checkpoint failed: {:#}", e);
        }
    }
}
