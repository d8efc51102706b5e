use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::command::BotCommands;
use teloxide::utils::html;

use crate::error::MonitorError;
use crate::services::monitoring_service::{ClientState, MonitoringStatus, StartOptions};
use crate::state::{AppState, HandlerResult};

pub mod admin;

pub use admin::handle_version;

/// 🎯 Setup monitor. Available commands:
#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase")]
pub enum Command {
    /// Show this help
    Help,
    /// Build information
    Version,
    /// <analysis> <strategy> [minutes] [auto]: watch a setup
    Monitor(String),
    /// <analysis> [strategy]: stop watching
    Unmonitor(String),
    /// <analysis> <strategy>: mute checks for you
    Pause(String),
    /// <analysis> <strategy>: unmute checks
    Resume(String),
    /// <analysis> [strategy]: current monitoring state
    Status(String),
}

/// Parsed `/monitor` arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorArgs {
    pub analysis_id: String,
    pub strategy_id: String,
    pub frequency_seconds: u32,
    pub auto_order: bool,
}

pub fn parse_monitor_args(raw: &str) -> Result<MonitorArgs, MonitorError> {
    let mut parts = raw.split_whitespace();
    let (Some(analysis_id), Some(strategy_id)) = (parts.next(), parts.next()) else {
        return Err(MonitorError::Validation(
            "usage: /monitor <analysis> <strategy> [minutes] [auto]".to_string(),
        ));
    };

    let mut args = MonitorArgs {
        analysis_id: analysis_id.to_string(),
        strategy_id: strategy_id.to_string(),
        frequency_seconds: 900,
        auto_order: false,
    };
    for part in parts {
        if part.eq_ignore_ascii_case("auto") {
            args.auto_order = true;
        } else {
            let minutes: u32 = part
                .parse()
                .map_err(|_| MonitorError::Validation(format!("'{}' is not a number of minutes", part)))?;
            args.frequency_seconds = minutes.saturating_mul(60);
        }
    }
    Ok(args)
}

/// `<analysis> [strategy]`
pub fn parse_setup_args(raw: &str) -> Result<(String, Option<String>), MonitorError> {
    let mut parts = raw.split_whitespace();
    let analysis_id = parts
        .next()
        .ok_or_else(|| MonitorError::Validation("an analysis id is required".to_string()))?;
    Ok((analysis_id.to_string(), parts.next().map(str::to_string)))
}

fn user_of(msg: &Message) -> Option<i64> {
    msg.from.as_ref().map(|u| u.id.0 as i64)
}

async fn reply(bot: &Bot, msg: &Message, text: String) -> HandlerResult {
    bot.send_message(msg.chat.id, text).parse_mode(ParseMode::Html).await?;
    Ok(())
}

fn failure_text(err: &MonitorError) -> String {
    if err.is_internal() {
        tracing::error!("❌ {}: {:#}", err.code(), err);
        "❌ Something went wrong, please try again later.".to_string()
    } else {
        format!("⚠️ {}", html::escape(&err.to_string()))
    }
}

pub fn render_status(status: &MonitoringStatus) -> String {
    let (icon, label) = match status.state {
        ClientState::Active => ("🟢", "Active"),
        ClientState::Paused => ("⏸", "Paused"),
        ClientState::Finished => ("🏁", "Finished"),
        ClientState::Expired => ("⌛", "Expired"),
        ClientState::Error => ("❗", "Error"),
        ClientState::Inactive => ("⚪", "Not monitored"),
    };
    let mut text = format!(
        "{} <b>{}</b> · <code>{}</code>",
        icon,
        label,
        html::escape(&status.analysis_id)
    );
    if let Some(strategy_id) = &status.strategy_id {
        text.push_str(&format!(" / <code>{}</code>", html::escape(strategy_id)));
    }
    if status.subscriber_count > 0 {
        text.push_str(&format!("\nSubscribers: {}", status.subscriber_count));
    }
    if let Some(price) = status.trigger_price {
        text.push_str(&format!("\nTriggered at <code>{:.2}</code>", price));
    }
    if let Some(reason) = status.stop_reason {
        text.push_str(&format!("\n{}", reason.describe()));
    }
    if let (Some(expires_at), ClientState::Active | ClientState::Paused) = (status.expires_at, status.state) {
        text.push_str(&format!("\nValid until {}", expires_at.format("%Y-%m-%d %H:%M UTC")));
    }
    text
}

pub async fn handle_help(bot: Bot, msg: Message) -> HandlerResult {
    reply(&bot, &msg, html::escape(&Command::descriptions().to_string())).await
}

pub async fn handle_monitor(bot: Bot, msg: Message, args: String, state: Arc<AppState>) -> HandlerResult {
    let Some(user_id) = user_of(&msg) else {
        return Ok(());
    };
    tracing::info!("Handling /monitor for user {}: {}", user_id, args);

    let result = match parse_monitor_args(&args) {
        Ok(args) => {
            state
                .monitoring
                .start_monitoring(
                    &args.analysis_id,
                    &args.strategy_id,
                    user_id,
                    args.frequency_seconds,
                    StartOptions {
                        auto_order: Some(args.auto_order),
                    },
                )
                .await
        }
        Err(e) => Err(e),
    };

    let text = match result {
        Ok(started) if started.already_triggered => format!(
            "🎯 This setup already triggered. You have been added to its {} subscriber(s).",
            started.subscriber_count
        ),
        Ok(started) => format!(
            "✅ Monitoring started ({} subscriber(s)).\nValid until {}",
            started.subscriber_count,
            started.expires_at.format("%Y-%m-%d %H:%M UTC")
        ),
        Err(e) => failure_text(&e),
    };
    reply(&bot, &msg, text).await
}

pub async fn handle_unmonitor(bot: Bot, msg: Message, args: String, state: Arc<AppState>) -> HandlerResult {
    let Some(user_id) = user_of(&msg) else {
        return Ok(());
    };
    let result = match parse_setup_args(&args) {
        Ok((analysis_id, strategy_id)) => {
            state
                .monitoring
                .stop_monitoring(&analysis_id, strategy_id.as_deref(), Some(user_id))
                .await
        }
        Err(e) => Err(e),
    };
    let text = match result {
        Ok(res) if res.cancelled_count == 0 => "ℹ️ You were not monitoring that.".to_string(),
        Ok(res) => format!("🛑 Stopped {} monitor(s).", res.cancelled_count),
        Err(e) => failure_text(&e),
    };
    reply(&bot, &msg, text).await
}

pub async fn handle_pause(bot: Bot, msg: Message, args: String, state: Arc<AppState>) -> HandlerResult {
    toggle_pause(bot, msg, args, state, true).await
}

pub async fn handle_resume(bot: Bot, msg: Message, args: String, state: Arc<AppState>) -> HandlerResult {
    toggle_pause(bot, msg, args, state, false).await
}

async fn toggle_pause(bot: Bot, msg: Message, args: String, state: Arc<AppState>, pause: bool) -> HandlerResult {
    let Some(user_id) = user_of(&msg) else {
        return Ok(());
    };
    let result = match parse_setup_args(&args) {
        Ok((analysis_id, Some(strategy_id))) if pause => {
            state.monitoring.pause_monitoring(&analysis_id, &strategy_id, Some(user_id)).await
        }
        Ok((analysis_id, Some(strategy_id))) => {
            state.monitoring.resume_monitoring(&analysis_id, &strategy_id, Some(user_id)).await
        }
        Ok((_, None)) => Err(MonitorError::Validation("a strategy id is required".to_string())),
        Err(e) => Err(e),
    };
    let text = match result {
        Ok(status) => render_status(&status),
        Err(e) => failure_text(&e),
    };
    reply(&bot, &msg, text).await
}

pub async fn handle_status(bot: Bot, msg: Message, args: String, state: Arc<AppState>) -> HandlerResult {
    let Some(user_id) = user_of(&msg) else {
        return Ok(());
    };
    let result = match parse_setup_args(&args) {
        Ok((analysis_id, strategy_id)) => {
            state
                .monitoring
                .get_monitoring_status(&analysis_id, strategy_id.as_deref(), Some(user_id))
                .await
        }
        Err(e) => Err(e),
    };
    let text = match result {
        Ok(status) => render_status(&status),
        Err(e) => failure_text(&e),
    };
    reply(&bot, &msg, text).await
}
