use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::entity::{monitoring_subscriptions, stock_analyses};
use shared::{AnalysisStrategy, AuditStatus, MonitoringConfig, StopReason, SubscriptionStatus};
use tracing::{info, warn};

use super::market_calendar::MarketCalendar;
use super::notification::{self, notify_all, NotificationDispatcher};
use super::registry::{StockInfo, SubscribeRequest, SubscriptionRegistry};
use super::replanner::Replanner;
use super::trigger_client::TriggerEvaluator;
use crate::error::MonitorError;
use crate::repositories::{AnalysisRepository, AuditEntry, AuditRepository};

pub const MIN_FREQUENCY_SECONDS: u32 = 60;
pub const MAX_FREQUENCY_SECONDS: u32 = 86_400;

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub auto_order: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartMonitoringResult {
    pub subscription_id: i64,
    pub subscriber_count: usize,
    pub expires_at: DateTime<Utc>,
    /// The setup had already triggered; the requester joined its outcome.
    pub already_triggered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopMonitoringResult {
    pub cancelled_count: usize,
}

/// Client-facing view of a subscription's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    Active,
    Finished,
    Expired,
    Paused,
    Error,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringStatus {
    pub state: ClientState,
    pub analysis_id: String,
    pub strategy_id: Option<String>,
    pub subscriber_count: usize,
    pub expires_at: Option<DateTime<Utc>>,
    pub conditions_met_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
    pub trigger_price: Option<f64>,
}

/// Entry point for callers: validates requests and drives the registry.
pub struct MonitoringService {
    registry: Arc<SubscriptionRegistry>,
    analyses: Arc<AnalysisRepository>,
    audit: Arc<AuditRepository>,
    calendar: Arc<dyn MarketCalendar>,
    evaluator: Arc<dyn TriggerEvaluator>,
    notifier: Arc<dyn NotificationDispatcher>,
    replanner: Arc<Replanner>,
}

impl MonitoringService {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        analyses: Arc<AnalysisRepository>,
        audit: Arc<AuditRepository>,
        calendar: Arc<dyn MarketCalendar>,
        evaluator: Arc<dyn TriggerEvaluator>,
        notifier: Arc<dyn NotificationDispatcher>,
        replanner: Arc<Replanner>,
    ) -> Self {
        Self {
            registry,
            analyses,
            audit,
            calendar,
            evaluator,
            notifier,
            replanner,
        }
    }

    pub async fn start_monitoring(
        &self,
        analysis_id: &str,
        strategy_id: &str,
        user_id: i64,
        frequency_seconds: u32,
        options: StartOptions,
    ) -> Result<StartMonitoringResult, MonitorError> {
        validate_id("analysis id", analysis_id)?;
        validate_id("strategy id", strategy_id)?;
        if !(MIN_FREQUENCY_SECONDS..=MAX_FREQUENCY_SECONDS).contains(&frequency_seconds) {
            return Err(MonitorError::Validation(format!(
                "frequency must be between {} and {} seconds",
                MIN_FREQUENCY_SECONDS, MAX_FREQUENCY_SECONDS
            )));
        }

        let (analysis, strategy) = self.load_monitorable(analysis_id, strategy_id).await?;

        let can_start = self.registry.can_start(analysis_id, strategy_id).await?;
        if !can_start.can_start {
            return Err(MonitorError::CannotStart(
                can_start.reason.unwrap_or_else(|| "Monitoring cannot be started".to_string()),
            ));
        }

        let now = Utc::now();
        let cutoff = self.calendar.next_validity_cutoff(now).await?;
        let expires_at = cutoff.min(analysis.valid_until);

        let sub = self
            .registry
            .find_or_create(SubscribeRequest {
                analysis_id: analysis_id.to_string(),
                strategy_id: strategy_id.to_string(),
                user_id,
                stock: StockInfo {
                    stock_symbol: analysis.stock_symbol.clone(),
                    instrument_key: analysis.instrument_key.clone(),
                },
                job_ref: None,
                config: MonitoringConfig {
                    frequency_seconds,
                    timeframes: timeframes_of(&strategy),
                },
                auto_order: options.auto_order,
                expires_at,
            })
            .await?;

        info!(
            "👀 User {} monitoring {}/{} ({} subscriber(s))",
            user_id,
            analysis_id,
            strategy_id,
            sub.subscribers.len()
        );
        self.replanner.request_replan();

        Ok(StartMonitoringResult {
            subscription_id: sub.id,
            subscriber_count: sub.subscribers.len(),
            expires_at: sub.expires_at,
            already_triggered: sub.status == SubscriptionStatus::ConditionsMet,
        })
    }

    /// Removes `user_id` (or every subscriber) from one strategy, or from all strategies of the analysis.
    pub async fn stop_monitoring(
        &self,
        analysis_id: &str,
        strategy_id: Option<&str>,
        user_id: Option<i64>,
    ) -> Result<StopMonitoringResult, MonitorError> {
        validate_id("analysis id", analysis_id)?;
        let subs = match strategy_id {
            Some(strategy_id) => {
                validate_id("strategy id", strategy_id)?;
                self.registry.find(analysis_id, strategy_id).await?.into_iter().collect()
            }
            None => self.registry.find_by_analysis(analysis_id).await?,
        };

        let mut cancelled_count = 0;
        for sub in subs {
            let analysis_id = sub.analysis_id.clone();
            let strategy_id = sub.strategy_id.clone();
            let sub_symbol = sub.stock_symbol.clone();
            let was_active = sub.status == SubscriptionStatus::Active;

            let (removed_users, deleted) = match user_id {
                Some(user_id) => {
                    if sub.subscribers.find(user_id).is_none() {
                        continue;
                    }
                    let remaining = self.registry.remove_user(sub, user_id).await?;
                    (vec![user_id], remaining.is_none())
                }
                None => {
                    let users = sub.subscribers.user_ids();
                    self.registry.delete(sub).await?;
                    (users, true)
                }
            };
            cancelled_count += 1;

            if deleted {
                if let Err(e) = self.evaluator.clear_session(&analysis_id, &strategy_id).await {
                    warn!("⚠️ Failed to clear evaluator session {}/{}: {:#}", analysis_id, strategy_id, e);
                }
            }
            if was_active && user_id.is_none() {
                self.notify_cancelled(&sub_symbol, &analysis_id, &strategy_id, &removed_users).await;
            }
            if was_active {
                let entries = AuditEntry::for_users(
                    &analysis_id,
                    &strategy_id,
                    &removed_users,
                    AuditStatus::Cancelled,
                    Some(StopReason::UserCancelled.describe().to_string()),
                    None,
                    None,
                );
                if let Err(e) = self.audit.record(entries).await {
                    warn!("⚠️ Failed to audit cancellation of {}/{}: {:#}", analysis_id, strategy_id, e);
                }
            }
        }

        if cancelled_count > 0 {
            info!("🛑 Stopped {} subscription(s) of analysis {}", cancelled_count, analysis_id);
            self.replanner.request_replan();
        }
        Ok(StopMonitoringResult { cancelled_count })
    }

    /// Tells every subscriber removed by a setup-wide stop that monitoring ended.
    async fn notify_cancelled(
        &self,
        symbol: &str,
        analysis_id: &str,
        strategy_id: &str,
        user_ids: &[i64],
    ) {
        let analysis = match self.analyses.find_by_id(analysis_id).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("⚠️ Failed to load analysis {} for the cancellation notice: {:#}", analysis_id, e);
                None
            }
        };
        let strategy_name = analysis
            .and_then(|a| a.strategies.0.into_iter().find(|s| s.id == strategy_id))
            .map_or_else(|| strategy_id.to_string(), |s| s.name);
        match notification::monitoring_stopped(
            analysis_id,
            strategy_id,
            symbol,
            &strategy_name,
            StopReason::UserCancelled,
            None,
        ) {
            Ok(notice) => {
                let unreachable = notify_all(self.notifier.as_ref(), user_ids, &notice).await;
                if !unreachable.is_empty() {
                    warn!("⚠️ {} user(s) missed the cancellation of {}/{}", unreachable.len(), analysis_id, strategy_id);
                }
            }
            Err(e) => warn!("⚠️ Failed to render cancellation notice: {:#}", e),
        }
    }

    pub async fn pause_monitoring(
        &self,
        analysis_id: &str,
        strategy_id: &str,
        user_id: Option<i64>,
    ) -> Result<MonitoringStatus, MonitorError> {
        validate_id("analysis id", analysis_id)?;
        validate_id("strategy id", strategy_id)?;
        let sub = self.subscribed(analysis_id, strategy_id, user_id).await?;
        let sub = self.registry.pause_user(sub, user_id).await?;
        info!("⏸ Paused {}/{} for {:?}", analysis_id, strategy_id, user_id);
        self.replanner.request_replan();
        Ok(status_of(&sub, user_id, Utc::now()))
    }

    pub async fn resume_monitoring(
        &self,
        analysis_id: &str,
        strategy_id: &str,
        user_id: Option<i64>,
    ) -> Result<MonitoringStatus, MonitorError> {
        validate_id("analysis id", analysis_id)?;
        validate_id("strategy id", strategy_id)?;
        self.load_monitorable(analysis_id, strategy_id).await?;
        let sub = self.subscribed(analysis_id, strategy_id, user_id).await?;
        let sub = self.registry.resume_user(sub, user_id).await?;
        info!("▶️ Resumed {}/{} for {:?}", analysis_id, strategy_id, user_id);
        self.replanner.request_replan();
        Ok(status_of(&sub, user_id, Utc::now()))
    }

    /// Status of one strategy, or the most relevant state across the analysis.
    pub async fn get_monitoring_status(
        &self,
        analysis_id: &str,
        strategy_id: Option<&str>,
        user_id: Option<i64>,
    ) -> Result<MonitoringStatus, MonitorError> {
        validate_id("analysis id", analysis_id)?;
        let now = Utc::now();
        let subs = match strategy_id {
            Some(strategy_id) => self.registry.find(analysis_id, strategy_id).await?.into_iter().collect(),
            None => self.registry.find_by_analysis(analysis_id).await?,
        };
        let subs: Vec<monitoring_subscriptions::Model> = subs
            .into_iter()
            .filter(|s| user_id.map_or(true, |u| s.subscribers.find(u).is_some()))
            .collect();

        let mut statuses: Vec<MonitoringStatus> = subs.iter().map(|s| status_of(s, user_id, now)).collect();

        if statuses.iter().any(|s| s.state == ClientState::Active || s.state == ClientState::Paused)
            && self.analyses.find_by_id(analysis_id).await?.is_none()
        {
            for status in statuses.iter_mut() {
                if matches!(status.state, ClientState::Active | ClientState::Paused) {
                    status.state = ClientState::Error;
                }
            }
        }

        let best = statuses.into_iter().min_by_key(|s| state_rank(s.state));
        Ok(best.unwrap_or(MonitoringStatus {
            state: ClientState::Inactive,
            analysis_id: analysis_id.to_string(),
            strategy_id: strategy_id.map(str::to_string),
            subscriber_count: 0,
            expires_at: None,
            conditions_met_at: None,
            stop_reason: None,
            trigger_price: None,
        }))
    }

    /// Analysis and strategy that can be watched right now.
    async fn load_monitorable(
        &self,
        analysis_id: &str,
        strategy_id: &str,
    ) -> Result<(stock_analyses::Model, AnalysisStrategy), MonitorError> {
        let analysis = self
            .analyses
            .find_by_id(analysis_id)
            .await?
            .ok_or_else(|| MonitorError::AnalysisNotFound(analysis_id.to_string()))?;
        let strategy = analysis
            .strategies
            .find(strategy_id)
            .cloned()
            .ok_or_else(|| MonitorError::StrategyNotFound {
                analysis_id: analysis_id.to_string(),
                strategy_id: strategy_id.to_string(),
            })?;
        validate_strategy(&strategy)?;

        if analysis.valid_until <= Utc::now() {
            return Err(MonitorError::AnalysisExpired);
        }
        if analysis.orders_placed {
            return Err(MonitorError::OrdersAlreadyPlaced);
        }
        Ok((analysis, strategy))
    }

    async fn subscribed(
        &self,
        analysis_id: &str,
        strategy_id: &str,
        user_id: Option<i64>,
    ) -> Result<monitoring_subscriptions::Model, MonitorError> {
        let sub = self
            .registry
            .active_for(analysis_id, strategy_id)
            .await?
            .ok_or(MonitorError::NotMonitoring)?;
        if let Some(user_id) = user_id {
            if sub.subscribers.find(user_id).is_none() {
                return Err(MonitorError::NotMonitoring);
            }
        }
        Ok(sub)
    }
}

fn validate_id(what: &str, id: &str) -> Result<(), MonitorError> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MonitorError::Validation(format!("{} '{}' is not valid", what, id)))
    }
}

fn validate_strategy(strategy: &AnalysisStrategy) -> Result<(), MonitorError> {
    if strategy.triggers.is_empty() {
        return Err(MonitorError::Validation(format!(
            "strategy {} has no entry triggers configured",
            strategy.id
        )));
    }
    let levels = [
        ("entry", strategy.entry),
        ("target", strategy.target),
        ("stop loss", strategy.stop_loss),
    ];
    for (name, level) in levels {
        match level {
            Some(v) if v.is_finite() && v > 0.0 => {}
            _ => {
                return Err(MonitorError::Validation(format!(
                    "strategy {} is missing a valid {}",
                    strategy.id, name
                )))
            }
        }
    }
    if !matches!(strategy.kind.to_ascii_uppercase().as_str(), "BUY" | "SELL") {
        return Err(MonitorError::Validation(format!(
            "strategy {} has unknown side '{}'",
            strategy.id, strategy.kind
        )));
    }
    Ok(())
}

fn timeframes_of(strategy: &AnalysisStrategy) -> Vec<String> {
    let mut timeframes: Vec<String> = strategy.triggers.iter().map(|t| t.timeframe.clone()).collect();
    timeframes.sort();
    timeframes.dedup();
    if timeframes.is_empty() {
        MonitoringConfig::default().timeframes
    } else {
        timeframes
    }
}

fn status_of(sub: &monitoring_subscriptions::Model, user_id: Option<i64>, now: DateTime<Utc>) -> MonitoringStatus {
    let state = match sub.status {
        SubscriptionStatus::Active if sub.is_expired(now) => ClientState::Expired,
        SubscriptionStatus::Active => {
            let paused = match user_id.and_then(|u| sub.subscribers.find(u)) {
                Some(subscriber) => subscriber.is_paused(),
                None => sub.subscribers.all_paused(),
            };
            if paused {
                ClientState::Paused
            } else {
                ClientState::Active
            }
        }
        SubscriptionStatus::Expired => ClientState::Expired,
        SubscriptionStatus::ConditionsMet | SubscriptionStatus::Invalidated | SubscriptionStatus::Cancelled => {
            ClientState::Finished
        }
    };

    MonitoringStatus {
        state,
        analysis_id: sub.analysis_id.clone(),
        strategy_id: Some(sub.strategy_id.clone()),
        subscriber_count: sub.subscribers.len(),
        expires_at: Some(sub.expires_at),
        conditions_met_at: sub.conditions_met_at,
        stop_reason: sub.stop_reason,
        trigger_price: sub.last_trigger_snapshot.as_ref().map(|s| s.price),
    }
}

fn state_rank(state: ClientState) -> u8 {
    match state {
        ClientState::Active => 0,
        ClientState::Paused => 1,
        ClientState::Error => 2,
        ClientState::Finished => 3,
        ClientState::Expired => 4,
        ClientState::Inactive => 5,
    }
}
