//! HTTP Collaborators
//!
//! Live perception (market-state API) and live reasoning (completion API).
//! Failures are mapped onto `ErrorClass` so the resilience layer can decide
//! between retrying and falling back:
//! - 429 → rate limited (retryable)
//! - 502/503/504 → unavailable, other 5xx → system
//! - 401/403 → auth, other 4xx → validation
//! - unparsable body → malformed

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::collaborators::{Perception, Reasoner};
use crate::resilience::{CallError, ErrorClass};
use crate::types::{MarketState, RiskAssessment};

/// Map a non-success HTTP status to a classified error
pub fn classify_status(status: StatusCode, body: &str) -> CallError {
    let class = match status.as_u16() {
        429 => ErrorClass::RateLimited,
        502..=504 => ErrorClass::ResourceUnavailable,
        500..=599 => ErrorClass::System,
        401 | 403 => ErrorClass::Auth,
        _ => ErrorClass::Validation,
    };
    let snippet: String = body.chars().take(200).collect();
    CallError::new(class, format!("HTTP {}: {}", status, snippet))
}

fn classify_transport(error: reqwest::Error) -> CallError {
    let class = if error.is_timeout() {
        ErrorClass::Timeout
    } else if error.is_decode() {
        ErrorClass::Malformed
    } else {
        ErrorClass::Transient
    };
    CallError::new(class, error.to_string())
}

/// Market-state API client
pub struct LivePerception {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl LivePerception {
    pub fn new(base_url: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build perception HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl Perception for LivePerception {
    fn name(&self) -> &str {
        "live_perception"
    }

    async fn fetch_state(&self) -> Result<MarketState, CallError> {
        let url = format!("{}/market-state", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-KEY", key);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let state: MarketState = serde_json::from_str(&body)
            .map_err(|e| CallError::malformed(format!("Failed to parse market state: {}", e)))?;
        state
            .validate()
            .map_err(|e| CallError::malformed(format!("Invalid market state: {}", e)))?;

        debug!(liquidity = state.liquidity_depth, "Fetched live market state");
        Ok(state)
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
}

/// Completion-API reasoner
pub struct LiveReasoner {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl LiveReasoner {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build reasoning HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }
}

/// Risk-analysis prompt for one forecast
pub fn build_prompt(current: &MarketState, predicted: &MarketState) -> String {
    let change = if current.liquidity_depth > 0.0 {
        (predicted.liquidity_depth - current.liquidity_depth) / current.liquidity_depth * 100.0
    } else {
        0.0
    };

    format!(
        "You are an institutional risk analyst for DeFi protocols.\n\n\
         Current market state:\n\
         - Liquidity depth: ${:.0}\n\
         - Volatility index: {:.2}\n\
         - Governance risk score: {:.2}\n\n\
         Model forecast if the proposal passes:\n\
         - Predicted liquidity: ${:.0}\n\
         - Change: {:.1}%\n\n\
         Respond with JSON only:\n\
         {{\"risk_level\": \"SAFE\" | \"WARNING\" | \"CRITICAL\", \
         \"recommended_action\": \"MONITOR\" | \"ALERT_DAO_TREASURY\" | \"BLOCK_PROPOSAL\", \
         \"reasoning\": \"2-3 sentences\", \"confidence\": 0.0-1.0}}",
        current.liquidity_depth,
        current.volatility_index,
        current.governance_risk_score,
        predicted.liquidity_depth,
        change
    )
}

/// Extract a `RiskAssessment` from completion text, tolerating prose around the JSON
pub fn parse_assessment(text: &str) -> Result<RiskAssessment, CallError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => return Err(CallError::malformed("No JSON object in completion")),
    };

    let mut assessment: RiskAssessment = serde_json::from_str(json)
        .map_err(|e| CallError::malformed(format!("Failed to parse assessment: {}", e)))?;
    if !assessment.confidence.is_finite() {
        return Err(CallError::malformed("Non-finite confidence"));
    }
    assessment.confidence = assessment.confidence.clamp(0.0, 1.0);
    Ok(assessment)
}

#[async_trait]
impl Reasoner for LiveReasoner {
    fn name(&self) -> &str {
        "live_reasoner"
    }

    async fn assess(
        &self,
        current: &MarketState,
        predicted: &MarketState,
    ) -> Result<RiskAssessment, CallError> {
        let payload = serde_json::json!({
            "model": self.model,
            "prompt": build_prompt(current, predicted),
            "temperature": 0.3,
            "max_tokens": 500,
        });

        let url = format!("{}/v1/completions", self.base_url);
        let mut request = self.client.post(&url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let completion: CompletionResponse = serde_json::from_str(&body)
            .map_err(|e| CallError::malformed(format!("Failed to parse completion: {}", e)))?;
        let text = completion
            .choices
            .first()
            .map(|c| c.text.as_str())
            .ok_or_else(|| CallError::malformed("Completion has no choices"))?;

        parse_assessment(text)
    }
}
