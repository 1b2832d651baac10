//! Latent-space world model
//!
//! Encodes a market state into a latent vector, predicts the next latent
//! given an action, and decodes a residual forecast:
//!
//! ```text
//! z  = tanh(W_e x + b_e)
//! p  = W_p [z; a] + b_p
//! x' = x + W_d p + b_d
//! ```
//!
//! Trained with plain SGD on mean squared error against observed outcomes.
//! Parameters are initialised from a seed, so two models built with the same
//! config predict identically.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::types::{Action, MarketState, ResolvedSample};

const FEATURES: usize = 3;

/// Confidence reported before the model has seen enough training
pub const UNTRAINED_CONFIDENCE: f64 = 0.70;
/// Confidence reported once the model passed `mature_after_steps`
pub const TRAINED_CONFIDENCE: f64 = 0.85;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub latent_dim: usize,
    pub learning_rate: f64,
    pub seed: u64,
    /// Training steps before confidence is raised
    pub mature_after_steps: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            latent_dim: 16,
            learning_rate: 0.01,
            seed: 7,
            mature_after_steps: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    fn random(rows: usize, cols: usize, scale: f64, rng: &mut StdRng) -> Self {
        Self {
            rows,
            cols,
            data: (0..rows * cols).map(|_| rng.gen_range(-scale..scale)).collect(),
        }
    }

    fn is_shaped(&self, rows: usize, cols: usize) -> bool {
        self.rows == rows && self.cols == cols && self.data.len() == rows * cols
    }

    /// W v
    fn mul_vec(&self, v: &[f64]) -> Vec<f64> {
        self.data
            .chunks(self.cols)
            .map(|row| row.iter().zip(v).map(|(w, x)| w * x).sum())
            .collect()
    }

    /// Wᵀ v
    fn t_mul_vec(&self, v: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.cols];
        for (row, &scale) in self.data.chunks(self.cols).zip(v) {
            for (o, w) in out.iter_mut().zip(row) {
                *o += w * scale;
            }
        }
        out
    }

    /// self += a ⊗ b
    fn add_outer(&mut self, a: &[f64], b: &[f64]) {
        for (row, &ai) in self.data.chunks_mut(self.cols).zip(a) {
            for (w, &bj) in row.iter_mut().zip(b) {
                *w += ai * bj;
            }
        }
    }

    fn step(&mut self, grad: &Matrix, lr: f64) {
        for (w, g) in self.data.iter_mut().zip(&grad.data) {
            *w -= lr * g;
        }
    }
}

fn add_into(target: &mut [f64], other: &[f64]) {
    for (t, o) in target.iter_mut().zip(other) {
        *t += o;
    }
}

fn step_vec(params: &mut [f64], grad: &[f64], lr: f64) {
    for (w, g) in params.iter_mut().zip(grad) {
        *w -= lr * g;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Parameters {
    w_enc: Matrix,
    b_enc: Vec<f64>,
    w_pred: Matrix,
    b_pred: Vec<f64>,
    w_dec: Matrix,
    b_dec: Vec<f64>,
}

impl Parameters {
    fn init(latent: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let enc_scale = (1.0 / FEATURES as f64).sqrt();
        let pred_scale = (1.0 / (latent + 1) as f64).sqrt();
        Self {
            w_enc: Matrix::random(latent, FEATURES, enc_scale, &mut rng),
            b_enc: vec![0.0; latent],
            w_pred: Matrix::random(latent, latent + 1, pred_scale, &mut rng),
            b_pred: vec![0.0; latent],
            // Small decoder so an untrained model stays near persistence
            w_dec: Matrix::random(FEATURES, latent, 0.1 * (1.0 / latent as f64).sqrt(), &mut rng),
            b_dec: vec![0.0; FEATURES],
        }
    }

    fn zeros(latent: usize) -> Self {
        Self {
            w_enc: Matrix::zeros(latent, FEATURES),
            b_enc: vec![0.0; latent],
            w_pred: Matrix::zeros(latent, latent + 1),
            b_pred: vec![0.0; latent],
            w_dec: Matrix::zeros(FEATURES, latent),
            b_dec: vec![0.0; FEATURES],
        }
    }

    fn latent_dim(&self) -> usize {
        self.b_enc.len()
    }

    fn is_consistent(&self) -> bool {
        let l = self.latent_dim();
        l > 0
            && self.w_enc.is_shaped(l, FEATURES)
            && self.w_pred.is_shaped(l, l + 1)
            && self.b_pred.len() == l
            && self.w_dec.is_shaped(FEATURES, l)
            && self.b_dec.len() == FEATURES
    }

    fn forward(&self, x: &[f64; FEATURES], action: f64) -> Forward {
        let z: Vec<f64> = self
            .w_enc
            .mul_vec(x)
            .iter()
            .zip(&self.b_enc)
            .map(|(h, b)| (h + b).tanh())
            .collect();

        let mut u = z.clone();
        u.push(action);

        let mut p = self.w_pred.mul_vec(&u);
        add_into(&mut p, &self.b_pred);

        let y = self.w_dec.mul_vec(&p);
        let mut out = *x;
        for i in 0..FEATURES {
            out[i] += y[i] + self.b_dec[i];
        }

        Forward { z, u, p, out }
    }

    fn apply(&mut self, grads: &Parameters, lr: f64) {
        self.w_enc.step(&grads.w_enc, lr);
        step_vec(&mut self.b_enc, &grads.b_enc, lr);
        self.w_pred.step(&grads.w_pred, lr);
        step_vec(&mut self.b_pred, &grads.b_pred, lr);
        self.w_dec.step(&grads.w_dec, lr);
        step_vec(&mut self.b_dec, &grads.b_dec, lr);
    }
}

struct Forward {
    z: Vec<f64>,
    u: Vec<f64>,
    p: Vec<f64>,
    out: [f64; FEATURES],
}

#[derive(Debug)]
struct TrainingState {
    params: Parameters,
    steps: u64,
    loss_history: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    version: String,
    saved_at: DateTime<Utc>,
    config: ModelConfig,
    steps: u64,
    loss_history: Vec<f64>,
    params: Parameters,
}

/// Predictive model with interior mutability for background training
pub struct PredictiveModel {
    config: ModelConfig,
    state: RwLock<TrainingState>,
}

impl PredictiveModel {
    pub fn new(config: ModelConfig) -> Self {
        let latent = config.latent_dim.max(1);
        let params = Parameters::init(latent, config.seed);
        info!(latent_dim = latent, seed = config.seed, "Predictive model initialised");
        Self {
            config: ModelConfig {
                latent_dim: latent,
                ..config
            },
            state: RwLock::new(TrainingState {
                params,
                steps: 0,
                loss_history: Vec::new(),
            }),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Completed training steps
    pub fn steps(&self) -> u64 {
        self.state.read().steps
    }

    pub fn loss_history(&self) -> Vec<f64> {
        self.state.read().loss_history.clone()
    }

    /// Forecast the state after `action`. Deterministic for fixed parameters.
    pub fn predict(&self, state: &MarketState, action: Action) -> (MarketState, f64) {
        let guard = self.state.read();
        let forward = guard.params.forward(&state.to_features(), action.as_value());
        let confidence = if guard.steps >= self.config.mature_after_steps {
            TRAINED_CONFIDENCE
        } else {
            UNTRAINED_CONFIDENCE
        };
        (MarketState::from_features(&forward.out), confidence)
    }

    /// One SGD step on mean squared error. Returns the pre-update loss.
    ///
    /// Gradients are computed on a parameter snapshot; the write lock is only
    /// taken to apply them.
    pub fn train_on_batch(&self, batch: &[ResolvedSample]) -> f64 {
        if batch.is_empty() {
            return 0.0;
        }

        let params = self.state.read().params.clone();
        let latent = params.latent_dim();
        let mut grads = Parameters::zeros(latent);
        let scale = 1.0 / (batch.len() * FEATURES) as f64;
        let mut loss = 0.0;

        for sample in batch {
            let x = sample.prediction.input_state.to_features();
            let target = sample.actual_state.to_features();
            let fwd = params.forward(&x, sample.prediction.action.as_value());

            let mut g_out = [0.0; FEATURES];
            for i in 0..FEATURES {
                let diff = fwd.out[i] - target[i];
                loss += diff * diff * scale;
                g_out[i] = 2.0 * diff * scale;
            }

            // Decoder
            grads.w_dec.add_outer(&g_out, &fwd.p);
            add_into(&mut grads.b_dec, &g_out);

            // Predictor
            let g_p = params.w_dec.t_mul_vec(&g_out);
            grads.w_pred.add_outer(&g_p, &fwd.u);
            add_into(&mut grads.b_pred, &g_p);

            // Encoder, through tanh; the action column carries no gradient back
            let g_u = params.w_pred.t_mul_vec(&g_p);
            let g_h: Vec<f64> = g_u[..latent]
                .iter()
                .zip(&fwd.z)
                .map(|(g, z)| g * (1.0 - z * z))
                .collect();
            grads.w_enc.add_outer(&g_h, &x);
            add_into(&mut grads.b_enc, &g_h);
        }

        if !loss.is_finite() {
            warn!(loss, "Non-finite training loss, skipping update");
            return loss;
        }

        let mut state = self.state.write();
        state.params.apply(&grads, self.config.learning_rate);
        state.steps += 1;
        state.loss_history.push(loss);
        debug!(step = state.steps, loss, batch = batch.len(), "Training step");

        loss
    }

    /// Write parameters and training progress to `<dir>/jepa_model_<version>.json`
    pub fn save_checkpoint(&self, dir: &Path, version: Option<&str>) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create checkpoint dir {}", dir.display()))?;

        let version = version
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().format("v%Y%m%d_%H%M%S").to_string());

        let checkpoint = {
            let state = self.state.read();
            Checkpoint {
                version: version.clone(),
                saved_at: Utc::now(),
                config: self.config.clone(),
                steps: state.steps,
                loss_history: state.loss_history.clone(),
                params: state.params.clone(),
            }
        };

        let path = dir.join(format!("jepa_model_{}.json", version));
        let json = serde_json::to_string(&checkpoint).context("Failed to serialize checkpoint")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write checkpoint {}", path.display()))?;

        info!(path = %path.display(), steps = checkpoint.steps, "Model checkpoint saved");
        Ok(path)
    }

    /// Restore a model from a checkpoint file
    pub fn load_checkpoint(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
        let checkpoint: Checkpoint =
            serde_json::from_str(&json).context("Failed to parse checkpoint")?;

        if !checkpoint.params.is_consistent()
            || checkpoint.params.latent_dim() != checkpoint.config.latent_dim
        {
            bail!("Checkpoint {} has inconsistent parameter shapes", path.display());
        }

        info!(
            path = %path.display(),
            version = %checkpoint.version,
            steps = checkpoint.steps,
            "Model checkpoint loaded"
        );

        Ok(Self {
            config: checkpoint.config,
            state: RwLock::new(TrainingState {
                params: checkpoint.params,
                steps: checkpoint.steps,
                loss_history: checkpoint.loss_history,
            }),
        })
    }

    /// Most recent `jepa_model_*.json` in `dir`, by file name
    pub fn latest_checkpoint(dir: &Path) -> Option<PathBuf> {
        let entries = std::fs::read_dir(dir).ok()?;
        entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("jepa_model_") && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .max()
    }
}
