use std::sync::Arc;

use anyhow::Result;
use migration::{Migrator, MigratorTrait};
use monitor::commands::{
    handle_help, handle_monitor, handle_pause, handle_resume, handle_status, handle_unmonitor,
    handle_version, Command,
};
use monitor::services::{ExchangeCalendar, HttpOrderExecutor, HttpTriggerEvaluator, TelegramNotifier};
use monitor::{AppState, Collaborators, MonitorSettings};
use shared::{get_db_connection, Config};
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use tracing_subscriber::EnvFilter;

fn schema() -> UpdateHandler<anyhow::Error> {
    use dptree::case;

    let command_handler = teloxide::filter_command::<Command, _>()
        .branch(case![Command::Help].endpoint(handle_help))
        .branch(case![Command::Version].endpoint(handle_version))
        .branch(case![Command::Monitor(args)].endpoint(handle_monitor))
        .branch(case![Command::Unmonitor(args)].endpoint(handle_unmonitor))
        .branch(case![Command::Pause(args)].endpoint(handle_pause))
        .branch(case![Command::Resume(args)].endpoint(handle_resume))
        .branch(case![Command::Status(args)].endpoint(handle_status));

    Update::filter_message().branch(command_handler)
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Starting setup monitor...");

    let config = Config::from_env()?;
    let db = get_db_connection(&config.database_url).await?;
    tracing::info!("Connected to database successfully");

    if config.run_migrations {
        Migrator::up(&db, None).await?;
        tracing::info!("✅ Migrations applied");
    }

    let bot = Bot::new(&config.bot_token);
    let collaborators = Collaborators {
        calendar: Arc::new(ExchangeCalendar::from_config(&config)),
        evaluator: Arc::new(HttpTriggerEvaluator::new(config.evaluator_url.clone())?),
        notifier: Arc::new(TelegramNotifier::new(bot.clone())),
        orders: Arc::new(HttpOrderExecutor::new(config.order_service_url.clone())?),
    };

    let state = AppState::assemble(Arc::new(db), MonitorSettings::from_config(&config), collaborators).await;
    state.start().await?;
    tracing::info!("AppState initialized");

    let mut dispatcher = Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![state.clone()])
        .enable_ctrlc_handler()
        .build();

    tracing::info!("Bot is running and waiting for updates...");
    dispatcher.dispatch().await;

    state.shutdown().await;
    Ok(())
}
