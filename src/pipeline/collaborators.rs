//! Collaborator Interfaces
//!
//! Capability traits for the remote-backed stages, plus the mock variants
//! used in `mock` mode and tests. The orchestrator depends only on the traits;
//! the variant is chosen once, at construction.

use anyhow::bail;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::str::FromStr;
use std::sync::Arc;

use super::live::{LivePerception, LiveReasoner};
use super::rules::{rule_assessment, RiskThresholds};
use crate::config::Config;
use crate::resilience::CallError;
use crate::types::{LiquidityEvent, LiquidityEventKind, MarketState, RiskAssessment};

/// Liquidity of an untouched pool
const BASE_LIQUIDITY: f64 = 10_000_000.0;
/// Governance risk added per risk-related proposal
const RISK_PER_PROPOSAL: f64 = 0.2;
/// Confidence of the rule-based reasoner when used as the primary path
pub const RULE_BASED_CONFIDENCE: f64 = 0.8;

/// Source of market states
#[async_trait]
pub trait Perception: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_state(&self) -> Result<MarketState, CallError>;
}

/// Interprets a forecast into a risk assessment
#[async_trait]
pub trait Reasoner: Send + Sync {
    fn name(&self) -> &str;

    async fn assess(
        &self,
        current: &MarketState,
        predicted: &MarketState,
    ) -> Result<RiskAssessment, CallError>;
}

/// Collaborator variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Mock,
    Live,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "live" => Ok(Self::Live),
            other => bail!("Unknown mode '{}', expected 'mock' or 'live'", other),
        }
    }
}

/// The capability set handed to the orchestrator
#[derive(Clone)]
pub struct Collaborators {
    pub perception: Arc<dyn Perception>,
    pub reasoner: Arc<dyn Reasoner>,
}

impl Collaborators {
    pub fn mock(seed: u64) -> Self {
        Self {
            perception: Arc::new(MockPerception::new(seed)),
            reasoner: Arc::new(MockReasoner::default()),
        }
    }

    /// Select the variant named by `config.mode`
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        match config.mode {
            Mode::Mock => Ok(Self::mock(config.model_seed)),
            Mode::Live => Ok(Self {
                perception: Arc::new(LivePerception::new(
                    &config.perception_url,
                    config.perception_api_key.clone(),
                )?),
                reasoner: Arc::new(LiveReasoner::new(
                    &config.llm_url,
                    &config.llm_model,
                    config.llm_api_key.clone(),
                )?),
            }),
        }
    }
}

/// Fold raw liquidity events and proposal count into a market state
pub fn normalize_events(events: &[LiquidityEvent], risk_proposals: usize) -> MarketState {
    let total_unstake: f64 = events
        .iter()
        .filter(|e| e.kind == LiquidityEventKind::Unstake)
        .map(|e| e.amount)
        .sum();

    MarketState::clamped(
        BASE_LIQUIDITY - total_unstake,
        0.5 + total_unstake / BASE_LIQUIDITY,
        risk_proposals as f64 * RISK_PER_PROPOSAL,
    )
}

/// Synthetic on-chain activity from a seeded generator
pub struct MockPerception {
    rng: Mutex<StdRng>,
    events_per_poll: usize,
}

impl MockPerception {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            events_per_poll: 5,
        }
    }

    fn next_events(&self) -> (Vec<LiquidityEvent>, usize) {
        let mut rng = self.rng.lock();
        let events = (0..self.events_per_poll)
            .map(|_| {
                let kind = match rng.gen_range(0..3) {
                    0 => LiquidityEventKind::Stake,
                    1 => LiquidityEventKind::Unstake,
                    _ => LiquidityEventKind::Swap,
                };
                let mut amount = rng.gen_range(1_000.0..1_000_000.0);
                if kind == LiquidityEventKind::Unstake {
                    // Unstakes are larger for risk simulation
                    amount *= 1.5;
                }
                LiquidityEvent {
                    pool_id: "0x123...abc".to_string(),
                    kind,
                    amount,
                    timestamp: Utc::now(),
                }
            })
            .collect();
        let risk_proposals = rng.gen_range(0..=2);
        (events, risk_proposals)
    }
}

#[async_trait]
impl Perception for MockPerception {
    fn name(&self) -> &str {
        "mock_perception"
    }

    async fn fetch_state(&self) -> Result<MarketState, CallError> {
        let (events, risk_proposals) = self.next_events();
        Ok(normalize_events(&events, risk_proposals))
    }
}

/// Rule-based reasoner
#[derive(Default)]
pub struct MockReasoner {
    thresholds: RiskThresholds,
}

impl MockReasoner {
    pub fn new(thresholds: RiskThresholds) -> Self {
        Self { thresholds }
    }
}

#[async_trait]
impl Reasoner for MockReasoner {
    fn name(&self) -> &str {
        "rule_based"
    }

    async fn assess(
        &self,
        current: &MarketState,
        predicted: &MarketState,
    ) -> Result<RiskAssessment, CallError> {
        Ok(rule_assessment(current, predicted, &self.thresholds, RULE_BASED_CONFIDENCE))
    }
}
