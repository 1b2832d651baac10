//! Configuration management

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::pipeline::Mode;

/// Service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Collaborator variant (mock or live)
    pub mode: Mode,

    /// Completion API for live reasoning
    pub llm_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,

    /// Market-state API for live perception
    pub perception_url: String,
    pub perception_api_key: Option<String>,

    /// SQLite database path for resolved samples
    pub db_path: PathBuf,

    /// JSON-lines reasoning trail
    pub reasoning_log_path: PathBuf,

    /// Model checkpoint directory
    pub checkpoint_dir: PathBuf,

    /// Time until a prediction may be resolved
    pub resolution_delay: Duration,

    pub enable_training: bool,
    pub training_interval: Duration,
    pub batch_size: usize,
    pub num_batches: usize,
    pub replay_capacity: usize,

    /// Deterministic model initialisation
    pub model_seed: u64,
    pub latent_dim: usize,

    /// Demo query cadence
    pub query_interval: Duration,

    /// Emit JSON log lines instead of human-readable ones
    pub log_json: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mode = std::env::var("SENSEFORGE_MODE")
            .unwrap_or_else(|_| "mock".to_string())
            .parse::<Mode>()
            .context("Invalid SENSEFORGE_MODE")?;

        let llm_url = std::env::var("SENSEFORGE_LLM_URL")
            .unwrap_or_else(|_| "https://api.ambient.ai".to_string());
        let llm_api_key = std::env::var("AMBIENT_API_KEY").ok();
        let llm_model =
            std::env::var("SENSEFORGE_LLM_MODEL").unwrap_or_else(|_| "ambient-1".to_string());

        let perception_url = std::env::var("SENSEFORGE_PERCEPTION_URL")
            .unwrap_or_else(|_| "https://opabinia.cambrian.org".to_string());
        let perception_api_key = std::env::var("CAMBRIAN_API_KEY").ok();

        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("senseforge");

        let db_path = env_path("SENSEFORGE_DB_PATH", || data_dir.join("accuracy.db"));
        let reasoning_log_path =
            env_path("SENSEFORGE_REASONING_LOG", || data_dir.join("reasoning.jsonl"));
        let checkpoint_dir = env_path("SENSEFORGE_CHECKPOINT_DIR", || data_dir.join("checkpoints"));

        let resolution_delay = Duration::from_secs(env_parse("SENSEFORGE_RESOLUTION_DELAY_SECS", 300)?);

        let enable_training = env_flag("SENSEFORGE_ENABLE_TRAINING", true);
        let training_interval =
            Duration::from_secs(env_parse("SENSEFORGE_TRAINING_INTERVAL_SECS", 300)?);
        let batch_size = env_parse("SENSEFORGE_BATCH_SIZE", 32)?;
        let num_batches = env_parse("SENSEFORGE_NUM_BATCHES", 10)?;
        let replay_capacity = env_parse("SENSEFORGE_REPLAY_CAPACITY", 10_000)?;

        let model_seed = env_parse("SENSEFORGE_MODEL_SEED", 7)?;
        let latent_dim = env_parse("SENSEFORGE_LATENT_DIM", 16)?;

        let query_interval = Duration::from_secs(env_parse("SENSEFORGE_QUERY_INTERVAL_SECS", 30)?);

        let log_json = env_flag("SENSEFORGE_LOG_JSON", false);

        Ok(Self {
            mode,
            llm_url,
            llm_api_key,
            llm_model,
            perception_url,
            perception_api_key,
            db_path,
            reasoning_log_path,
            checkpoint_dir,
            resolution_delay,
            enable_training,
            training_interval,
            batch_size,
            num_batches,
            replay_capacity,
            model_seed,
            latent_dim,
            query_interval,
            log_json,
        })
    }
}

fn env_path(key: &str, default: impl FnOnce() -> PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| default())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

/// Unset means `default`; a set but unparsable value is an error
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

// Platform-specific dirs fallback
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .ok()
                .or_else(|| {
                    std::env::var("HOME")
                        .map(|h| PathBuf::from(h).join(".local/share"))
                        .ok()
                })
        }

        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
                .ok()
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").map(PathBuf::from).ok()
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            None
        }
    }
}
