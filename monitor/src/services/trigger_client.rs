use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::entity::stock_analyses;
use shared::{AnalysisStrategy, EvaluatedTrigger, StopReason};

/// What the evaluator needs besides the strategy itself.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationContext {
    pub as_of: DateTime<Utc>,
    pub frequency_seconds: u32,
    pub timeframes: Vec<String>,
}

/// Conditions that end monitoring without a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardStopKind {
    Invalidated,
    EntryWindowElapsed,
}

impl From<HardStopKind> for StopReason {
    fn from(kind: HardStopKind) -> Self {
        match kind {
            HardStopKind::Invalidated => StopReason::Invalidated,
            HardStopKind::EntryWindowElapsed => StopReason::EntryWindowElapsed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardStop {
    pub kind: HardStopKind,
    #[serde(default)]
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub satisfied: bool,
    #[serde(default)]
    pub hard_stop: Option<HardStop>,
    #[serde(default)]
    pub evaluated_triggers: Vec<EvaluatedTrigger>,
    pub current_price: f64,
    #[serde(default)]
    pub timeframe_data: Value,
}

/// Evaluates a strategy's entry triggers against live market data.
///
/// Implementations may keep per-setup session state (for example candles seen so far);
/// `clear_session` is called once monitoring of the setup stops.
#[async_trait]
pub trait TriggerEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        analysis: &stock_analyses::Model,
        strategy: &AnalysisStrategy,
        ctx: &EvaluationContext,
    ) -> Result<Evaluation>;

    async fn clear_session(&self, analysis_id: &str, strategy_id: &str) -> Result<()>;
}

/// Talks to the trigger evaluation service over HTTP.
pub struct HttpTriggerEvaluator {
    client: Client,
    base_url: String,
}

impl HttpTriggerEvaluator {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build evaluator HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TriggerEvaluator for HttpTriggerEvaluator {
    async fn evaluate(
        &self,
        analysis: &stock_analyses::Model,
        strategy: &AnalysisStrategy,
        ctx: &EvaluationContext,
    ) -> Result<Evaluation> {
        let url = format!("{}/api/v1/evaluate", self.base_url);
        let body = json!({
            "analysis_id": analysis.id,
            "stock_symbol": analysis.stock_symbol,
            "instrument_key": analysis.instrument_key,
            "strategy": strategy,
            "context": ctx,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Evaluator request failed for {}/{}", analysis.id, strategy.id))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Evaluator returned {} for {}/{}: {}", status, analysis.id, strategy.id, text);
        }

        let evaluation = response
            .json::<Evaluation>()
            .await
            .context("Evaluator returned an unreadable body")?;
        Ok(evaluation)
    }

    async fn clear_session(&self, analysis_id: &str, strategy_id: &str) -> Result<()> {
        let url = format!("{}/api/v1/sessions/{}/{}", self.base_url, analysis_id, strategy_id);
        let response = self.client.delete(&url).send().await?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("Evaluator refused to clear session {}/{}: {}", analysis_id, strategy_id, response.status());
        }
        Ok(())
    }
}
