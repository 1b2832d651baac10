//! Deterministic rules: fallback forecast, rule-based risk assessment and
//! the audit checks applied to every assessment. Nothing here touches a
//! remote dependency.

use crate::types::{AuditVerification, MarketState, RecommendedAction, RiskAssessment, RiskLevel};

/// Liquidity-drop thresholds for the rule-based assessment, in percent
#[derive(Debug, Clone, PartialEq)]
pub struct RiskThresholds {
    /// Drop above this is CRITICAL
    pub critical_drop_pct: f64,
    /// Drop above this is WARNING
    pub warning_drop_pct: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            critical_drop_pct: 10.0,
            warning_drop_pct: 5.0,
        }
    }
}

/// Forecast used when the model is unavailable: nothing changes
pub fn persistence_forecast(input: &MarketState) -> MarketState {
    *input
}

/// Threshold-based assessment of the predicted liquidity drop
pub fn rule_assessment(
    current: &MarketState,
    predicted: &MarketState,
    thresholds: &RiskThresholds,
    confidence: f64,
) -> RiskAssessment {
    let drop_pct = current.liquidity_drop_pct(predicted);

    let (risk_level, recommended_action, reasoning) = if drop_pct > thresholds.critical_drop_pct {
        (
            RiskLevel::Critical,
            RecommendedAction::AlertDaoTreasury,
            format!("Predicted liquidity drop of {:.1}% exceeds safety threshold.", drop_pct),
        )
    } else if drop_pct > thresholds.warning_drop_pct {
        (
            RiskLevel::Warning,
            RecommendedAction::Monitor,
            format!("Moderate risk detected. {:.1}% liquidity reduction predicted.", drop_pct),
        )
    } else {
        (
            RiskLevel::Safe,
            RecommendedAction::Monitor,
            "Market conditions appear stable.".to_string(),
        )
    };

    RiskAssessment {
        risk_level,
        recommended_action,
        reasoning,
        confidence: confidence.clamp(0.0, 1.0),
    }
}

/// Apply the safety rules to an assessment
pub fn audit(assessment: &RiskAssessment, degraded: bool) -> AuditVerification {
    let mut violations = Vec::new();

    if assessment.recommended_action == RecommendedAction::AlertDaoTreasury
        && assessment.risk_level != RiskLevel::Critical
    {
        violations.push("REJECTED: Cannot alert treasury for non-critical risk.");
    }
    if assessment.risk_level == RiskLevel::Critical
        && assessment.recommended_action == RecommendedAction::Monitor
    {
        violations.push("REJECTED: Critical risk requires active intervention.");
    }
    if assessment.risk_level == RiskLevel::Safe
        && assessment.recommended_action == RecommendedAction::BlockProposal
    {
        violations.push("REJECTED: Cannot block a proposal assessed as safe.");
    }

    let mut comments = if violations.is_empty() {
        "Action within safety parameters.".to_string()
    } else {
        violations.join(" ")
    };
    if degraded {
        comments.push_str(&format!(
            " Assessment produced in degraded mode (confidence {:.2}).",
            assessment.confidence
        ));
    }

    AuditVerification {
        approved: violations.is_empty(),
        comments,
    }
}
