use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde_json::json;
use shared::entity::{monitoring_subscriptions, stock_analyses};
use shared::{
    AnalysisStrategy, AuditStatus, AutoOrderResult, MarketConditions, StopReason, Subscriber,
    TriggerSnapshot,
};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::market_calendar::MarketCalendar;
use super::notification::{self, notify_all, Notification, NotificationDispatcher};
use super::order_service::OrderExecutor;
use super::planner::{Batch, BatchPerformanceMetrics};
use super::registry::SubscriptionRegistry;
use super::trigger_client::{Evaluation, EvaluationContext, TriggerEvaluator};
use crate::repositories::{AnalysisRepository, AuditEntry, AuditRepository};

/// An order-placement flag older than this was left behind by a crashed run.
pub const ORDER_LOCK_STALE_MINUTES: i64 = 5;

/// What one per-strategy check decided.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Triggered { price: f64 },
    HardStopped(StopReason),
    Pending,
    Rejected(StopReason),
    MarketClosed,
    Paused,
    /// No live subscription for the strategy.
    Unwatched,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisReport {
    pub analysis_id: String,
    pub outcomes: Vec<(String, CheckOutcome)>,
}

/// Collaborators the executor drives.
pub struct ExecutorDeps {
    pub registry: Arc<SubscriptionRegistry>,
    pub analyses: Arc<AnalysisRepository>,
    pub audit: Arc<AuditRepository>,
    pub calendar: Arc<dyn MarketCalendar>,
    pub evaluator: Arc<dyn TriggerEvaluator>,
    pub notifier: Arc<dyn NotificationDispatcher>,
    pub orders: Arc<dyn OrderExecutor>,
}

/// Runs one batch firing: every analysis concurrently, each failure contained to its analysis.
pub struct BatchExecutor {
    deps: ExecutorDeps,
}

struct Delivery {
    user_id: i64,
    notified: bool,
    order: Option<AutoOrderResult>,
}

impl BatchExecutor {
    pub fn new(deps: ExecutorDeps) -> Self {
        Self { deps }
    }

    pub async fn execute_batch(self: &Arc<Self>, batch: &Batch) -> BatchPerformanceMetrics {
        let started = Instant::now();
        let mut tasks = JoinSet::new();
        for analysis_id in &batch.analysis_ids {
            let this = self.clone();
            let analysis_id = analysis_id.clone();
            tasks.spawn(async move {
                let res = this.process_analysis(&analysis_id).await;
                (analysis_id, res)
            });
        }

        let mut metrics = BatchPerformanceMetrics {
            batch_id: batch.batch_id.clone(),
            ..Default::default()
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_report))) => metrics.success_count += 1,
                Ok((analysis_id, Err(e))) => {
                    error!("❌ Analysis {} failed in {}: {:#}", analysis_id, batch.batch_id, e);
                    metrics.error_count += 1;
                    metrics.errors.push(format!("{}: {:#}", analysis_id, e));
                }
                Err(join_err) => {
                    error!("❌ Analysis task panicked in {}: {}", batch.batch_id, join_err);
                    metrics.error_count += 1;
                    metrics.errors.push(format!("panic: {}", join_err));
                }
            }
        }

        metrics.processing_time_ms = started.elapsed().as_millis() as u64;
        info!(
            "📊 {} done: {} ok, {} failed in {}ms",
            batch.batch_id, metrics.success_count, metrics.error_count, metrics.processing_time_ms
        );
        metrics
    }

    /// Checks every watched strategy of one analysis.
    pub async fn process_analysis(&self, analysis_id: &str) -> Result<AnalysisReport> {
        let mut report = AnalysisReport {
            analysis_id: analysis_id.to_string(),
            outcomes: Vec::new(),
        };

        let Some(analysis) = self.deps.analyses.find_by_id(analysis_id).await? else {
            for sub in self.live_subscriptions_of(analysis_id).await? {
                let strategy_id = sub.strategy_id.clone();
                let outcome = if self.stop_with_notice(sub, None, StopReason::AnalysisMissing, None, None).await? {
                    CheckOutcome::Rejected(StopReason::AnalysisMissing)
                } else {
                    CheckOutcome::Unwatched
                };
                report.outcomes.push((strategy_id, outcome));
            }
            return Ok(report);
        };

        let mut failures = Vec::new();
        for strategy in &analysis.strategies.0 {
            let Some(sub) = self.deps.registry.active_for(&analysis.id, &strategy.id).await? else {
                report.outcomes.push((strategy.id.clone(), CheckOutcome::Unwatched));
                continue;
            };
            match self.check_strategy(&analysis, strategy, sub).await {
                Ok(outcome) => report.outcomes.push((strategy.id.clone(), outcome)),
                Err(e) => failures.push(format!("{}: {:#}", strategy.id, e)),
            }
        }

        // subscriptions whose strategy was removed from the analysis
        let known: HashSet<&str> = analysis.strategies.0.iter().map(|s| s.id.as_str()).collect();
        for sub in self.live_subscriptions_of(analysis_id).await? {
            if known.contains(sub.strategy_id.as_str()) {
                continue;
            }
            let strategy_id = sub.strategy_id.clone();
            let outcome = if self.stop_with_notice(sub, None, StopReason::StrategyMissing, None, None).await? {
                CheckOutcome::Rejected(StopReason::StrategyMissing)
            } else {
                CheckOutcome::Unwatched
            };
            report.outcomes.push((strategy_id, outcome));
        }

        if !failures.is_empty() {
            return Err(anyhow!("{} strategy check(s) failed: {}", failures.len(), failures.join("; ")));
        }
        Ok(report)
    }

    async fn live_subscriptions_of(&self, analysis_id: &str) -> Result<Vec<monitoring_subscriptions::Model>> {
        let now = Utc::now();
        Ok(self
            .deps
            .registry
            .find_by_analysis(analysis_id)
            .await?
            .into_iter()
            .filter(|s| s.is_live(now))
            .collect())
    }

    /// Policy guards, market hours, pause state, then the evaluator.
    ///
    /// A check that loses the race to move the subscription out of `Active`
    /// reports `Unwatched` and sends nothing.
    pub async fn check_strategy(
        &self,
        analysis: &stock_analyses::Model,
        strategy: &AnalysisStrategy,
        sub: monitoring_subscriptions::Model,
    ) -> Result<CheckOutcome> {
        let now = Utc::now();

        if let Some(reason) = self.policy_violation(analysis, now).await? {
            if !self.stop_with_notice(sub, Some(&strategy.name), reason, None, None).await? {
                return Ok(CheckOutcome::Unwatched);
            }
            return Ok(CheckOutcome::Rejected(reason));
        }

        if !self.deps.calendar.is_market_open(now).await? {
            debug!("Market closed, skipping {}/{}", analysis.id, strategy.id);
            return Ok(CheckOutcome::MarketClosed);
        }

        if sub.subscribers.all_paused() {
            debug!("All subscribers paused, skipping {}/{}", analysis.id, strategy.id);
            return Ok(CheckOutcome::Paused);
        }

        let ctx = EvaluationContext {
            as_of: now,
            frequency_seconds: sub.config.frequency_seconds,
            timeframes: sub.config.timeframes.clone(),
        };
        let started = Instant::now();
        let evaluation = match self.deps.evaluator.evaluate(analysis, strategy, &ctx).await {
            Ok(evaluation) => evaluation,
            Err(e) => {
                let entries = AuditEntry::for_users(
                    &analysis.id,
                    &strategy.id,
                    &sub.subscribers.user_ids(),
                    AuditStatus::Error,
                    Some(format!("{:#}", e)),
                    None,
                    Some(started.elapsed().as_millis() as i64),
                );
                self.record_audit(entries).await;
                return Err(e.context(format!("Evaluation failed for {}/{}", analysis.id, strategy.id)));
            }
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        if let Some(hard_stop) = evaluation.hard_stop.clone() {
            let reason = StopReason::from(hard_stop.kind);
            let details = json!({
                "current_price": evaluation.current_price,
                "evaluated_triggers": evaluation.evaluated_triggers,
                "details": hard_stop.details,
                "duration_ms": duration_ms,
            });
            let stopped = self
                .stop_with_notice(sub, Some(&strategy.name), reason, hard_stop.details.as_deref(), Some(details))
                .await?;
            if !stopped {
                return Ok(CheckOutcome::Unwatched);
            }
            return Ok(CheckOutcome::HardStopped(reason));
        }

        if evaluation.satisfied {
            let price = evaluation.current_price;
            if !self.handle_trigger(analysis, strategy, sub, evaluation, duration_ms).await? {
                return Ok(CheckOutcome::Unwatched);
            }
            return Ok(CheckOutcome::Triggered { price });
        }

        let active_users: Vec<i64> = sub
            .subscribers
            .0
            .iter()
            .filter(|s| !s.is_paused())
            .map(|s| s.user_id)
            .collect();
        let entries = AuditEntry::for_users(
            &analysis.id,
            &strategy.id,
            &active_users,
            AuditStatus::NotTriggered,
            None,
            Some(json!({
                "current_price": evaluation.current_price,
                "evaluated_triggers": evaluation.evaluated_triggers,
            })),
            Some(duration_ms),
        );
        self.record_audit(entries).await;
        Ok(CheckOutcome::Pending)
    }

    async fn policy_violation(&self, analysis: &stock_analyses::Model, now: DateTime<Utc>) -> Result<Option<StopReason>> {
        if analysis.valid_until <= now {
            return Ok(Some(StopReason::AnalysisExpired));
        }
        if analysis.orders_placed {
            return Ok(Some(StopReason::OrdersPlaced));
        }
        if analysis.order_placement_in_progress {
            let fresh = analysis
                .order_placement_started_at
                .map_or(false, |at| now - at < Duration::minutes(ORDER_LOCK_STALE_MINUTES));
            if fresh {
                return Ok(Some(StopReason::OrderInProgress));
            }
            warn!("🔓 Clearing abandoned order-placement flag on {}", analysis.id);
            self.deps.analyses.clear_order_placement(&analysis.id).await?;
        }
        Ok(None)
    }

    async fn handle_trigger(
        &self,
        analysis: &stock_analyses::Model,
        strategy: &AnalysisStrategy,
        sub: monitoring_subscriptions::Model,
        evaluation: Evaluation,
        duration_ms: i64,
    ) -> Result<bool> {
        let now = Utc::now();
        let price = evaluation.current_price;

        let snapshot = snapshot_of(&evaluation, now);
        let Some(sub) = self.deps.registry.mark_conditions_met(sub, snapshot).await? else {
            debug!("Trigger for {}/{} already handled by another check", analysis.id, strategy.id);
            return Ok(false);
        };
        info!("🎯 Conditions met for {}/{} at {:.2}", analysis.id, strategy.id, price);

        let recipients: Vec<Subscriber> = sub.subscribers.0.iter().filter(|s| !s.is_paused()).cloned().collect();
        let notice = notification::conditions_met(
            &analysis.id,
            &analysis.stock_symbol,
            strategy,
            price,
            &evaluation.evaluated_triggers,
        )?;

        let order_lock = if recipients.iter().any(|s| s.auto_order) {
            let stale_before = now - Duration::minutes(ORDER_LOCK_STALE_MINUTES);
            self.deps
                .analyses
                .try_begin_order_placement(&analysis.id, now, stale_before)
                .await?
        } else {
            false
        };

        let deliveries = join_all(
            recipients
                .iter()
                .map(|subscriber| self.deliver(analysis, strategy, subscriber, &notice, price, order_lock)),
        )
        .await;

        if order_lock {
            let placed = deliveries.iter().any(|d| d.order.as_ref().map_or(false, |o| o.success));
            if let Err(e) = self.deps.analyses.finish_order_placement(&analysis.id, placed).await {
                error!("❌ Failed to release order-placement flag on {}: {:#}", analysis.id, e);
            }
        }

        let order_results: Vec<(i64, AutoOrderResult)> = deliveries
            .iter()
            .filter_map(|d| d.order.clone().map(|o| (d.user_id, o)))
            .collect();
        let sub = self.deps.registry.record_auto_order_results(sub, order_results).await?;
        let sub = self.deps.registry.mark_notification_sent(sub).await?;
        self.deps.registry.stop(sub, StopReason::ConditionsMet).await?;
        self.clear_session(&analysis.id, &strategy.id).await;

        let entries = deliveries
            .iter()
            .map(|d| AuditEntry {
                analysis_id: analysis.id.clone(),
                strategy_id: strategy.id.clone(),
                user_id: d.user_id,
                status: AuditStatus::Triggered,
                reason: None,
                details: Some(json!({
                    "current_price": price,
                    "notified": d.notified,
                    "auto_order": d.order,
                    "evaluated_triggers": evaluation.evaluated_triggers,
                })),
                duration_ms: Some(duration_ms),
            })
            .collect();
        self.record_audit(entries).await;
        Ok(true)
    }

    /// Notification and optional order for one subscriber. Never fails the caller.
    async fn deliver(
        &self,
        analysis: &stock_analyses::Model,
        strategy: &AnalysisStrategy,
        subscriber: &Subscriber,
        notice: &Notification,
        price: f64,
        order_lock: bool,
    ) -> Delivery {
        let user_id = subscriber.user_id;
        let notified = match self.deps.notifier.notify(user_id, notice).await {
            Ok(()) => true,
            Err(e) => {
                warn!("⚠️ Failed to notify user {} for {}/{}: {:#}", user_id, analysis.id, strategy.id, e);
                false
            }
        };

        if !subscriber.auto_order {
            return Delivery {
                user_id,
                notified,
                order: None,
            };
        }

        let result = if !order_lock {
            AutoOrderResult {
                success: false,
                order_id: None,
                error: Some("Orders for this analysis are already placed or being placed".to_string()),
            }
        } else {
            match self
                .deps
                .orders
                .place_conditional_order(user_id, strategy, &analysis.instrument_key, price)
                .await
            {
                Ok(result) => result,
                Err(e) => AutoOrderResult {
                    success: false,
                    order_id: None,
                    error: Some(format!("{:#}", e)),
                },
            }
        };
        if result.success {
            info!("✅ Auto order placed for user {} on {}", user_id, analysis.stock_symbol);
        } else {
            warn!("⚠️ Auto order failed for user {} on {}: {:?}", user_id, analysis.stock_symbol, result.error);
        }

        match notification::auto_order(&analysis.id, &analysis.stock_symbol, &result) {
            Ok(follow_up) => {
                if let Err(e) = self.deps.notifier.notify(user_id, &follow_up).await {
                    warn!("⚠️ Failed to send auto-order result to user {}: {:#}", user_id, e);
                }
            }
            Err(e) => warn!("⚠️ Failed to render auto-order result: {:#}", e),
        }

        Delivery {
            user_id,
            notified,
            order: Some(result),
        }
    }

    /// Terminal stop with a notice to every subscriber, an audit row each, and a cleared session.
    /// Returns `false` without side effects when the subscription was no longer active.
    async fn stop_with_notice(
        &self,
        sub: monitoring_subscriptions::Model,
        strategy_name: Option<&str>,
        reason: StopReason,
        details: Option<&str>,
        audit_details: Option<serde_json::Value>,
    ) -> Result<bool> {
        let analysis_id = sub.analysis_id.clone();
        let strategy_id = sub.strategy_id.clone();
        let symbol = sub.stock_symbol.clone();
        let user_ids = sub.subscribers.user_ids();
        if self.deps.registry.stop(sub, reason).await?.is_none() {
            return Ok(false);
        }

        let unreachable = match notification::monitoring_stopped(
            &analysis_id,
            &strategy_id,
            &symbol,
            strategy_name.unwrap_or(&strategy_id),
            reason,
            details,
        ) {
            Ok(notice) => notify_all(self.deps.notifier.as_ref(), &user_ids, &notice).await,
            Err(e) => {
                warn!("⚠️ Failed to render stop notice for {}/{}: {:#}", analysis_id, strategy_id, e);
                user_ids.clone()
            }
        };

        let entries = user_ids
            .iter()
            .map(|&user_id| AuditEntry {
                analysis_id: analysis_id.clone(),
                strategy_id: strategy_id.clone(),
                user_id,
                status: reason.audit_status(),
                reason: Some(reason.describe().to_string()),
                details: Some(json!({
                    "stop_reason": reason,
                    "notified": !unreachable.contains(&user_id),
                    "evaluation": audit_details,
                })),
                duration_ms: None,
            })
            .collect();
        self.record_audit(entries).await;
        self.clear_session(&analysis_id, &strategy_id).await;
        Ok(true)
    }

    async fn clear_session(&self, analysis_id: &str, strategy_id: &str) {
        if let Err(e) = self.deps.evaluator.clear_session(analysis_id, strategy_id).await {
            warn!("⚠️ Failed to clear evaluator session {}/{}: {:#}", analysis_id, strategy_id, e);
        }
    }

    async fn record_audit(&self, entries: Vec<AuditEntry>) {
        if let Err(e) = self.deps.audit.record(entries).await {
            error!("❌ Failed to write audit records: {:#}", e);
        }
    }
}

fn snapshot_of(evaluation: &Evaluation, now: DateTime<Utc>) -> TriggerSnapshot {
    let mut timeframes: Vec<String> = evaluation
        .evaluated_triggers
        .iter()
        .map(|t| t.timeframe.clone())
        .collect();
    timeframes.sort();
    timeframes.dedup();

    TriggerSnapshot {
        price: evaluation.current_price,
        timeframe_data: evaluation.timeframe_data.clone(),
        evaluated_triggers: evaluation.evaluated_triggers.clone(),
        market_conditions: MarketConditions {
            current_price: evaluation.current_price,
            triggers_met: evaluation.evaluated_triggers.iter().filter(|t| t.satisfied).count(),
            triggers_total: evaluation.evaluated_triggers.len(),
            timeframes,
        },
        captured_at: now,
    }
}
