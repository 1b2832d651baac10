//! Domain Types
//!
//! Immutable values passed between the pipeline stages, the predictive
//! model and the prediction tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scale applied to liquidity depth before it enters the model
pub const LIQUIDITY_SCALE: f64 = 10_000_000.0;

/// Rejected market state field
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} must be finite, got {value}")]
    NotFinite { field: &'static str, value: f64 },

    #[error("{field} must be non-negative, got {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("{field} must be within [0, 1], got {value}")]
    OutOfUnitRange { field: &'static str, value: f64 },
}

/// Normalized snapshot of a liquidity pool
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketState {
    pub liquidity_depth: f64,
    pub volatility_index: f64,
    pub governance_risk_score: f64,
}

impl MarketState {
    /// Create a validated market state
    pub fn new(
        liquidity_depth: f64,
        volatility_index: f64,
        governance_risk_score: f64,
    ) -> Result<Self, ValidationError> {
        let state = Self {
            liquidity_depth,
            volatility_index,
            governance_risk_score,
        };
        state.validate()?;
        Ok(state)
    }

    /// Build a state from raw model output, clamping into the valid domain.
    /// Non-finite components collapse to zero.
    pub fn clamped(liquidity_depth: f64, volatility_index: f64, governance_risk_score: f64) -> Self {
        let finite_or_zero = |v: f64| if v.is_finite() { v } else { 0.0 };
        Self {
            liquidity_depth: finite_or_zero(liquidity_depth).max(0.0),
            volatility_index: finite_or_zero(volatility_index).max(0.0),
            governance_risk_score: finite_or_zero(governance_risk_score).clamp(0.0, 1.0),
        }
    }

    /// Check the domain invariants
    pub fn validate(&self) -> Result<(), ValidationError> {
        let fields = [
            ("liquidity_depth", self.liquidity_depth),
            ("volatility_index", self.volatility_index),
            ("governance_risk_score", self.governance_risk_score),
        ];
        for (field, value) in fields {
            if !value.is_finite() {
                return Err(ValidationError::NotFinite { field, value });
            }
            if value < 0.0 {
                return Err(ValidationError::Negative { field, value });
            }
        }
        if self.governance_risk_score > 1.0 {
            return Err(ValidationError::OutOfUnitRange {
                field: "governance_risk_score",
                value: self.governance_risk_score,
            });
        }
        Ok(())
    }

    /// Model-space vector (liquidity scaled to order one)
    pub fn to_features(&self) -> [f64; 3] {
        [
            self.liquidity_depth / LIQUIDITY_SCALE,
            self.volatility_index,
            self.governance_risk_score,
        ]
    }

    /// Inverse of [`MarketState::to_features`]
    pub fn from_features(features: &[f64]) -> Self {
        let get = |i: usize| features.get(i).copied().unwrap_or(0.0);
        Self::clamped(get(0) * LIQUIDITY_SCALE, get(1), get(2))
    }

    /// Relative liquidity drop from `self` to `predicted`, in percent.
    /// Positive means liquidity is expected to fall.
    pub fn liquidity_drop_pct(&self, predicted: &MarketState) -> f64 {
        if self.liquidity_depth > 0.0 {
            (self.liquidity_depth - predicted.liquidity_depth) / self.liquidity_depth * 100.0
        } else {
            0.0
        }
    }
}

/// Governance decision under evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Pass,
    Reject,
    Abstain,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Reject => "REJECT",
            Self::Abstain => "ABSTAIN",
        }
    }

    /// Scalar encoding fed to the predictor
    pub fn as_value(&self) -> f64 {
        match self {
            Self::Pass => 1.0,
            Self::Reject => -1.0,
            Self::Abstain => 0.0,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Forecast produced by the predictive stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub input_state: MarketState,
    pub action: Action,
    pub predicted_state: MarketState,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub maturity_at: DateTime<Utc>,
}

impl Prediction {
    /// Create a prediction stamped now. Maturity is assigned by the tracker.
    pub fn new(
        input_state: MarketState,
        action: Action,
        predicted_state: MarketState,
        confidence: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("pred_{}", uuid::Uuid::new_v4().simple()),
            input_state,
            action,
            predicted_state,
            confidence: confidence.clamp(0.0, 1.0),
            created_at: now,
            maturity_at: now,
        }
    }

    /// Override the creation time (replayed or back-dated predictions)
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.maturity_at = created_at;
        self
    }
}

/// A prediction paired with the ground truth observed after maturity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSample {
    pub prediction: Prediction,
    pub actual_state: MarketState,
    pub absolute_error: f64,
    pub signed_error: f64,
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedSample {
    /// Pair a prediction with its outcome. Error is measured on liquidity depth.
    pub fn new(prediction: Prediction, actual_state: MarketState, resolved_at: DateTime<Utc>) -> Self {
        let signed_error = prediction.predicted_state.liquidity_depth - actual_state.liquidity_depth;
        Self {
            prediction,
            actual_state,
            absolute_error: signed_error.abs(),
            signed_error,
            resolved_at,
        }
    }

    /// `1 - |error| / actual`, clamped to [0, 1]
    pub fn accuracy(&self) -> f64 {
        let actual = self.actual_state.liquidity_depth;
        if actual > 0.0 {
            (1.0 - self.absolute_error / actual).clamp(0.0, 1.0)
        } else if self.absolute_error == 0.0 {
            1.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Safe,
    Warning,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendedAction {
    Monitor,
    AlertDaoTreasury,
    BlockProposal,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monitor => "MONITOR",
            Self::AlertDaoTreasury => "ALERT_DAO_TREASURY",
            Self::BlockProposal => "BLOCK_PROPOSAL",
        }
    }
}

/// Output of the reasoning stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,
    pub recommended_action: RecommendedAction,
    pub reasoning: String,
    pub confidence: f64,
}

/// Output of the validation stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditVerification {
    pub approved: bool,
    pub comments: String,
}

/// Raw on-chain liquidity movement, consumed by perception
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiquidityEventKind {
    Stake,
    Unstake,
    Swap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityEvent {
    pub pool_id: String,
    pub kind: LiquidityEventKind,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_state_validation() {
        assert!(MarketState::new(9_500_000.0, 0.52, 0.35).is_ok());
        assert!(matches!(
            MarketState::new(-1.0, 0.5, 0.1),
            Err(ValidationError::Negative { field: "liquidity_depth", .. })
        ));
        assert!(matches!(
            MarketState::new(1.0, 0.5, 1.5),
            Err(ValidationError::OutOfUnitRange { .. })
        ));
        assert!(matches!(
            MarketState::new(f64::NAN, 0.5, 0.1),
            Err(ValidationError::NotFinite { .. })
        ));
    }

    #[test]
    fn test_features_round_trip_clamps() {
        let state = MarketState::from_features(&[0.95, -0.2, 1.7]);
        assert!((state.liquidity_depth - 9_500_000.0).abs() < 1e-6);
        assert_eq!(state.volatility_index, 0.0);
        assert_eq!(state.governance_risk_score, 1.0);
    }

    #[test]
    fn test_liquidity_drop_pct() {
        let current = MarketState::new(10_000_000.0, 0.5, 0.2).unwrap();
        let predicted = MarketState::new(8_500_000.0, 0.5, 0.2).unwrap();
        assert!((current.liquidity_drop_pct(&predicted) - 15.0).abs() < 1e-9);

        let empty = MarketState::new(0.0, 0.5, 0.2).unwrap();
        assert_eq!(empty.liquidity_drop_pct(&predicted), 0.0);
    }

    #[test]
    fn test_resolved_sample_errors() {
        let input = MarketState::new(10_000_000.0, 0.5, 0.2).unwrap();
        let predicted = MarketState::new(9_000_000.0, 0.5, 0.2).unwrap();
        let actual = MarketState::new(10_000_000.0, 0.5, 0.2).unwrap();
        let prediction = Prediction::new(input, Action::Pass, predicted, 0.7);

        let sample = ResolvedSample::new(prediction, actual, Utc::now());
        assert_eq!(sample.signed_error, -1_000_000.0);
        assert_eq!(sample.absolute_error, 1_000_000.0);
        assert!((sample.accuracy() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_action_serialization() {
        assert_eq!(serde_json::to_string(&Action::Pass).unwrap(), "\"PASS\"");
        assert_eq!(
            serde_json::to_string(&RecommendedAction::AlertDaoTreasury).unwrap(),
            "\"ALERT_DAO_TREASURY\""
        );
    }
}
