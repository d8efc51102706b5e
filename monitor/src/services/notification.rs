use anyhow::{Context, Result};
use askama::Template;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use shared::{AnalysisStrategy, AutoOrderResult, EvaluatedTrigger, StopReason};
use teloxide::prelude::*;
use teloxide::types::{ChatId, ParseMode};

/// A message for one user. `metadata` travels with it for dispatchers that can use it.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub metadata: Value,
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(&self, user_id: i64, notification: &Notification) -> Result<()>;
}

/// Sends every user the same notification concurrently. Returns the users that could not be reached.
pub async fn notify_all(
    dispatcher: &dyn NotificationDispatcher,
    user_ids: &[i64],
    notification: &Notification,
) -> Vec<i64> {
    let sends = user_ids.iter().map(|&user_id| async move {
        let res = dispatcher.notify(user_id, notification).await;
        (user_id, res)
    });
    join_all(sends)
        .await
        .into_iter()
        .filter_map(|(user_id, res)| match res {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!("⚠️ Failed to notify user {}: {:#}", user_id, e);
                Some(user_id)
            }
        })
        .collect()
}

/// Delivers notifications as HTML Telegram messages to the user's private chat.
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl NotificationDispatcher for TelegramNotifier {
    async fn notify(&self, user_id: i64, notification: &Notification) -> Result<()> {
        let text = format!("<b>{}</b>\n\n{}", notification.title, notification.message);
        self.bot
            .send_message(ChatId(user_id), text)
            .parse_mode(ParseMode::Html)
            .await
            .with_context(|| format!("Telegram delivery to {} failed", user_id))?;
        Ok(())
    }
}

#[derive(Template)]
#[template(path = "conditions_met.html")]
struct ConditionsMetTemplate<'a> {
    symbol: &'a str,
    strategy_name: &'a str,
    kind: &'a str,
    price: f64,
    triggers: &'a [EvaluatedTrigger],
    entry: Option<f64>,
    target: Option<f64>,
    stop_loss: Option<f64>,
}

#[derive(Template)]
#[template(path = "monitoring_stopped.html")]
struct MonitoringStoppedTemplate<'a> {
    symbol: &'a str,
    strategy_name: &'a str,
    reason: &'a str,
    details: Option<&'a str>,
}

#[derive(Template)]
#[template(path = "auto_order.html")]
struct AutoOrderTemplate<'a> {
    symbol: &'a str,
    success: bool,
    order_id: Option<&'a str>,
    error: Option<&'a str>,
}

pub fn conditions_met(
    analysis_id: &str,
    symbol: &str,
    strategy: &AnalysisStrategy,
    price: f64,
    triggers: &[EvaluatedTrigger],
) -> Result<Notification> {
    let message = ConditionsMetTemplate {
        symbol,
        strategy_name: &strategy.name,
        kind: &strategy.kind,
        price,
        triggers,
        entry: strategy.entry,
        target: strategy.target,
        stop_loss: strategy.stop_loss,
    }
    .render()?;

    Ok(Notification {
        title: format!("Entry conditions met: {}", symbol),
        message,
        metadata: json!({
            "type": "conditions_met",
            "analysis_id": analysis_id,
            "strategy_id": strategy.id,
            "price": price,
        }),
    })
}

pub fn monitoring_stopped(
    analysis_id: &str,
    strategy_id: &str,
    symbol: &str,
    strategy_name: &str,
    reason: StopReason,
    details: Option<&str>,
) -> Result<Notification> {
    let message = MonitoringStoppedTemplate {
        symbol,
        strategy_name,
        reason: reason.describe(),
        details,
    }
    .render()?;

    Ok(Notification {
        title: format!("Monitoring stopped: {}", symbol),
        message,
        metadata: json!({
            "type": "monitoring_stopped",
            "analysis_id": analysis_id,
            "strategy_id": strategy_id,
            "reason": reason,
        }),
    })
}

pub fn auto_order(analysis_id: &str, symbol: &str, result: &AutoOrderResult) -> Result<Notification> {
    let message = AutoOrderTemplate {
        symbol,
        success: result.success,
        order_id: result.order_id.as_deref(),
        error: result.error.as_deref(),
    }
    .render()?;

    Ok(Notification {
        title: format!("Auto order: {}", symbol),
        message,
        metadata: json!({
            "type": "auto_order",
            "analysis_id": analysis_id,
            "result": result,
        }),
    })
}
