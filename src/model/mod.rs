//! Predictive model, replay buffer and the training loop that joins them.

pub mod predictive;
pub mod replay;
pub mod trainer;

pub use predictive::{ModelConfig, PredictiveModel, TRAINED_CONFIDENCE, UNTRAINED_CONFIDENCE};
pub use replay::{ReplayBuffer, ReplayError};
pub use trainer::{Trainer, TrainerConfig, TrainingStats};
