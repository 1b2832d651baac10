//! SenseForge - Entry Point
//!
//! Runs the demo service: a periodic query loop over the pipeline, a
//! resolution scheduler for matured predictions and background training.
//!
//! Flags:
//! - --once: run a single request, print the response and exit
//! - --help / -h: show usage

use anyhow::Context;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use senseforge::model::{ModelConfig, PredictiveModel, ReplayBuffer, Trainer, TrainerConfig};
use senseforge::pipeline::{PipelineConfig, PERCEPTION_DEPENDENCY};
use senseforge::{
    Action, Collaborators, Config, JsonlReasoningLog, PipelineMetrics, PipelineOrchestrator,
    PipelineRequest, PredictionTracker, ResilienceRegistry, ResilientCaller, SqliteAccuracyLog,
};

/// Resolved samples loaded into the replay buffer at startup
const WARM_START_LIMIT: usize = 10_000;
const RESOLUTION_TICK: Duration = Duration::from_secs(10);
/// Query-loop iterations between status reports
const REPORT_EVERY: u64 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let once = args.iter().any(|a| a == "--once");
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config = Config::from_env()?;
    init_logging(config.log_json)?;

    info!(mode = ?config.mode, "SenseForge v{}", env!("CARGO_PKG_VERSION"));

    let accuracy_log = Arc::new(
        SqliteAccuracyLog::open(&config.db_path).context("Failed to open accuracy log")?,
    );
    let reasoning_log = Arc::new(
        JsonlReasoningLog::open(&config.reasoning_log_path)
            .context("Failed to open reasoning log")?,
    );

    let model = Arc::new(load_model(&config));
    let buffer = Arc::new(ReplayBuffer::new(config.replay_capacity));
    let tracker = Arc::new(PredictionTracker::new(
        config.resolution_delay,
        buffer.clone(),
        accuracy_log,
    ));
    if let Err(e) = tracker.warm_start(WARM_START_LIMIT) {
        warn!("Warm start failed, starting with an empty replay buffer: {}", e);
    }

    let collaborators = Collaborators::from_config(&config)?;
    let registry = ResilienceRegistry::new();
    let pipeline_config = PipelineConfig::default();
    let metrics = Arc::new(PipelineMetrics::default());

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        collaborators.clone(),
        model.clone(),
        tracker.clone(),
        reasoning_log,
        metrics.clone(),
        &registry,
        pipeline_config.clone(),
    ));

    if once {
        let response = orchestrator
            .run(PipelineRequest::new(Action::Pass))
            .await
            .context("Pipeline request failed")?;
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let trainer = Arc::new(Trainer::new(
        TrainerConfig {
            batch_size: config.batch_size,
            num_batches: config.num_batches,
            interval: config.training_interval,
            seed: config.model_seed,
            checkpoint_dir: Some(config.checkpoint_dir.clone()),
            enabled: config.enable_training,
            ..Default::default()
        },
        model,
        buffer.clone(),
    ));
    let trainer_handle = tokio::spawn(trainer.clone().run_continuous(shutdown_rx.clone()));

    // Resolution shares the perception breaker and limiter with the pipeline
    let resolver = registry.caller(PERCEPTION_DEPENDENCY, &pipeline_config.perception);
    let resolution_handle = tokio::spawn(run_resolution(
        resolver,
        collaborators,
        tracker.clone(),
        shutdown_rx.clone(),
    ));

    let query_handle = tokio::spawn(run_queries(
        orchestrator.clone(),
        config.query_interval,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    shutdown_tx.send(true).ok();

    for result in join_all([query_handle, resolution_handle, trainer_handle]).await {
        if let Err(e) = result {
            error!("Background task failed: {}", e);
        }
    }

    info!("{}", metrics.snapshot().format());
    for stats in orchestrator.stage_stats() {
        info!("{}", stats.format());
    }
    if let Some(pct) = trainer.training_stats().improvement_pct {
        info!(improvement_pct = pct, "Training improvement");
    }
    info!("SenseForge stopped");
    Ok(())
}

fn print_help() {
    println!("SenseForge v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: senseforge [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --once       Run a single request and print the response");
    println!("  --help, -h   Show this help");
    println!();
    println!("Environment variables:");
    println!("  SENSEFORGE_MODE                 mock | live (default: mock)");
    println!("  AMBIENT_API_KEY                 Reasoning API key (live mode)");
    println!("  CAMBRIAN_API_KEY                Market-state API key (live mode)");
    println!("  SENSEFORGE_DB_PATH              Accuracy log database");
    println!("  SENSEFORGE_REASONING_LOG        Reasoning trail (JSON lines)");
    println!("  SENSEFORGE_CHECKPOINT_DIR       Model checkpoint directory");
    println!("  SENSEFORGE_LOG_JSON             Log JSON lines to stderr (1/true)");
}

fn init_logging(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder
            .with_ansi(false)
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))
    } else {
        builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))
    }
}

/// Latest checkpoint if one loads, otherwise a freshly initialised model
fn load_model(config: &Config) -> PredictiveModel {
    let fresh = ModelConfig {
        latent_dim: config.latent_dim,
        seed: config.model_seed,
        ..Default::default()
    };

    let Some(path) = PredictiveModel::latest_checkpoint(&config.checkpoint_dir) else {
        info!("No checkpoint found, starting from a fresh model");
        return PredictiveModel::new(fresh);
    };

    match PredictiveModel::load_checkpoint(&path) {
        Ok(model) => {
            info!(steps = model.steps(), "Loaded checkpoint {}", path.display());
            model
        }
        Err(e) => {
            warn!("Failed to load checkpoint {}: {:#}", path.display(), e);
            PredictiveModel::new(fresh)
        }
    }
}

/// Query loop: one request per tick, cycling through the actions
async fn run_queries(
    orchestrator: Arc<PipelineOrchestrator>,
    every: Duration,
    shutdown: watch::Receiver<bool>,
) {
    let actions = [Action::Pass, Action::Reject, Action::Abstain];
    let mut ticker = interval(every);
    let mut stop = shutdown.clone();
    let mut iteration: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
        }

        let action = actions[(iteration % actions.len() as u64) as usize];
        iteration += 1;

        match orchestrator
            .run_with_cancel(PipelineRequest::new(action), shutdown.clone())
            .await
        {
            Ok(response) => info!(
                chain_id = %response.chain_id,
                action = %action,
                risk = response.assessment.risk_level.as_str(),
                recommended = response.assessment.recommended_action.as_str(),
                confidence = response.assessment.confidence,
                approved = response.verification.approved,
                degraded = response.is_degraded(),
                "Assessment"
            ),
            Err(e) => warn!(action = %action, "Query failed: {}", e),
        }

        if iteration % REPORT_EVERY == 0 {
            info!("{}", orchestrator.metrics().snapshot().format());
        }
    }
    debug!("Query loop stopped");
}

/// Resolve matured predictions against freshly perceived states
async fn run_resolution(
    caller: ResilientCaller,
    collaborators: Collaborators,
    tracker: Arc<PredictionTracker>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(RESOLUTION_TICK);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let due = tracker.pending_due(chrono::Utc::now());
        if due.is_empty() {
            continue;
        }

        let actual = caller
            .call(|| {
                let perception = collaborators.perception.clone();
                async move { perception.fetch_state().await }
            })
            .await;
        let actual = match actual {
            Ok(state) => state,
            Err(e) => {
                warn!(pending = due.len(), "Cannot resolve predictions: {}", e);
                continue;
            }
        };

        for prediction in due {
            match tracker.resolve(&prediction.id, actual) {
                Ok(sample) => debug!(
                    id = %prediction.id,
                    absolute_error = sample.absolute_error,
                    "Prediction resolved"
                ),
                Err(e) => warn!(id = %prediction.id, "Resolution failed: {}", e),
            }
        }

        match tracker.accuracy_stats(100) {
            Ok(Some(stats)) => info!(
                count = stats.count,
                mae = stats.mae,
                rmse = stats.rmse,
                accuracy_pct = stats.accuracy_pct,
                "Prediction accuracy"
            ),
            Ok(None) => {}
            Err(e) => warn!("Failed to read accuracy stats: {}", e),
        }
    }
    debug!("Resolution scheduler stopped");
}
