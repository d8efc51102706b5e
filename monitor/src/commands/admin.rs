use std::sync::Arc;

use chrono::{TimeZone, Utc};
use teloxide::prelude::*;
use teloxide::types::ParseMode;

use crate::state::{AppState, HandlerResult};

/// Human readable build time; `BUILD_TIME` is a unix timestamp set by build.rs.
fn build_time() -> String {
    let raw = option_env!("BUILD_TIME").unwrap_or("unknown");
    raw.parse::<i64>()
        .ok()
        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// Handler for /version: git revision, build time and what the engine is currently running.
pub async fn handle_version(bot: Bot, msg: Message, state: Arc<AppState>) -> HandlerResult {
    tracing::info!(
        "Handling /version for user {:?}",
        msg.from.as_ref().map(|u| u.id.0)
    );

    let planner = state.planner.config().await;
    let version_info = format!(
        "✅ 🤖 <b>{} Version</b>\n\
        <b>Branch:</b> <code>{}</code>\n\
        <b>Tag:</b> <code>{}</code>\n\
        <b>Commit:</b> <code>{}</code>\n\
        <b>Build Time:</b> <code>{}</code>\n\
        <b>OS:</b> <code>{}</code>\n\
        <b>Scheduler:</b> <code>{}</code>\n\
        <b>Batch target size:</b> <code>{}</code>",
        state.bot_name,
        option_env!("GIT_BRANCH").unwrap_or("unknown"),
        option_env!("GIT_TAG").unwrap_or("unknown"),
        option_env!("GIT_HASH").unwrap_or("unknown"),
        build_time(),
        option_env!("CARGO_CFG_TARGET_OS").unwrap_or("unknown"),
        state.scheduler.instance_id(),
        planner.target_batch_size,
    );

    bot.send_message(msg.chat.id, version_info)
        .parse_mode(ParseMode::Html)
        .await?;

    Ok(())
}
