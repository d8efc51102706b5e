use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use shared::entity::monitoring_subscriptions::Model;
use shared::{AuditStatus, StopReason};
use tracing::{info, warn};

use super::batch_executor::ORDER_LOCK_STALE_MINUTES;
use super::market_calendar::MarketCalendar;
use super::notification::{self, notify_all, NotificationDispatcher};
use super::registry::SubscriptionRegistry;
use super::trigger_client::TriggerEvaluator;
use crate::repositories::{AnalysisRepository, AuditEntry, AuditRepository};

/// Terminal subscriptions are kept this long after their window closes.
pub const RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpirySweepReport {
    pub skipped: bool,
    pub expired: usize,
    pub audit_records: usize,
    /// Rows whose expiry or audit write failed; the sweep carries on past them.
    pub failures: usize,
    pub purged: u64,
}

pub struct MaintenanceService {
    registry: Arc<SubscriptionRegistry>,
    analyses: Arc<AnalysisRepository>,
    audit: Arc<AuditRepository>,
    calendar: Arc<dyn MarketCalendar>,
    evaluator: Arc<dyn TriggerEvaluator>,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl MaintenanceService {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        analyses: Arc<AnalysisRepository>,
        audit: Arc<AuditRepository>,
        calendar: Arc<dyn MarketCalendar>,
        evaluator: Arc<dyn TriggerEvaluator>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            registry,
            analyses,
            audit,
            calendar,
            evaluator,
            notifier,
        }
    }

    /// Clears order-placement flags left set by a run that never finished.
    pub async fn reclaim_stale_order_locks(&self, now: DateTime<Utc>) -> Result<u64> {
        let stale_before = now - Duration::minutes(ORDER_LOCK_STALE_MINUTES);
        let cleared = self.analyses.clear_stale_order_flags(stale_before).await?;
        if cleared > 0 {
            warn!("🔓 Reclaimed {} stale order-placement flag(s)", cleared);
        }
        Ok(cleared)
    }

    /// Expires every active subscription past its window one row at a time, then purges
    /// long-retired rows.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<ExpirySweepReport> {
        let today = self.calendar.market_date(now);
        if !self.calendar.is_trading_day(today).await? {
            info!("📅 {} is not a trading day, skipping expiry sweep", today);
            return Ok(ExpirySweepReport {
                skipped: true,
                ..Default::default()
            });
        }

        let due = self.registry.due_for_expiry(now).await?;
        let mut report = ExpirySweepReport::default();
        for sub in due {
            let id = sub.id;
            let sub = match self.registry.stop(sub, StopReason::Expired).await {
                Ok(Some(sub)) => sub,
                Ok(None) => continue,
                Err(e) => {
                    warn!("⚠️ Failed to expire subscription {}: {:#}", id, e);
                    report.failures += 1;
                    continue;
                }
            };
            report.expired += 1;
            self.finish_expired(&sub, &mut report).await;
        }

        report.purged = self
            .registry
            .purge_retired(now, Duration::days(RETENTION_DAYS))
            .await?;

        info!(
            "🧹 Expiry sweep: {} expired, {} audit record(s), {} failure(s), {} purged",
            report.expired, report.audit_records, report.failures, report.purged
        );
        Ok(report)
    }

    /// Audit rows, expiry notices and session cleanup for one expired subscription.
    async fn finish_expired(&self, sub: &Model, report: &mut ExpirySweepReport) {
        let user_ids = sub.subscribers.user_ids();
        let entries = AuditEntry::for_users(
            &sub.analysis_id,
            &sub.strategy_id,
            &user_ids,
            AuditStatus::Expired,
            Some("Monitoring window closed".to_string()),
            Some(json!({ "expires_at": sub.expires_at })),
            None,
        );
        match self.audit.record(entries).await {
            Ok(written) => report.audit_records += written,
            Err(e) => {
                warn!("⚠️ Failed to audit expiry of subscription {}: {:#}", sub.id, e);
                report.failures += 1;
            }
        }

        match notification::monitoring_stopped(
            &sub.analysis_id,
            &sub.strategy_id,
            &sub.stock_symbol,
            &sub.strategy_id,
            StopReason::Expired,
            None,
        ) {
            Ok(notice) => {
                notify_all(self.notifier.as_ref(), &user_ids, &notice).await;
            }
            Err(e) => warn!("⚠️ Failed to render expiry notice: {:#}", e),
        }

        if let Err(e) = self.evaluator.clear_session(&sub.analysis_id, &sub.strategy_id).await {
            warn!("⚠️ Failed to clear evaluator session {}/{}: {:#}", sub.analysis_id, sub.strategy_id, e);
        }
    }
}
