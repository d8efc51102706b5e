use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use shared::{AnalysisStrategy, AutoOrderResult};

#[async_trait]
pub trait OrderExecutor: Send + Sync {
    /// Places the entry/target/stop bracket for one user.
    async fn place_conditional_order(
        &self,
        user_id: i64,
        strategy: &AnalysisStrategy,
        instrument_key: &str,
        current_price: f64,
    ) -> Result<AutoOrderResult>;
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    success: bool,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpOrderExecutor {
    client: Client,
    base_url: String,
}

impl HttpOrderExecutor {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("Failed to build order HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl OrderExecutor for HttpOrderExecutor {
    async fn place_conditional_order(
        &self,
        user_id: i64,
        strategy: &AnalysisStrategy,
        instrument_key: &str,
        current_price: f64,
    ) -> Result<AutoOrderResult> {
        let url = format!("{}/api/v1/orders/conditional", self.base_url);
        let body = json!({
            "user_id": user_id,
            "instrument_key": instrument_key,
            "side": strategy.kind,
            "entry": strategy.entry,
            "target": strategy.target,
            "stop_loss": strategy.stop_loss,
            "current_price": current_price,
            "strategy_id": strategy.id,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Order request failed for user {}", user_id))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Ok(AutoOrderResult {
                success: false,
                order_id: None,
                error: Some(format!("Order service returned {}: {}", status, text)),
            });
        }

        let res: OrderResponse = response.json().await.context("Order service returned an unreadable body")?;
        Ok(AutoOrderResult {
            success: res.success,
            order_id: res.order_id,
            error: res.error,
        })
    }
}
