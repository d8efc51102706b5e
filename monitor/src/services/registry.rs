use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use sea_orm::{ActiveValue, ColumnTrait, Condition, DatabaseConnection};
use shared::entity::monitoring_subscriptions::{ActiveModel, Column, Model};
use shared::{
    AutoOrderResult, MonitoringConfig, StopReason, Subscriber, Subscribers, SubscriptionStatus,
    TriggerSnapshot,
};
use tracing::{debug, info};

use crate::repositories::{is_unique_violation, SubscriptionRepository};

/// A requester may join a setup that already triggered for this long.
pub const ATTACH_WINDOW_MINUTES: i64 = 45;

#[derive(Debug, Clone)]
pub struct StockInfo {
    pub stock_symbol: String,
    pub instrument_key: String,
}

#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub analysis_id: String,
    pub strategy_id: String,
    pub user_id: i64,
    pub stock: StockInfo,
    pub job_ref: Option<String>,
    pub config: MonitoringConfig,
    /// `None` keeps an existing subscriber's choice.
    pub auto_order: Option<bool>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanStart {
    pub can_start: bool,
    pub reason: Option<String>,
    pub conditions_met_at: Option<DateTime<Utc>>,
}

impl CanStart {
    fn allowed() -> Self {
        Self {
            can_start: true,
            reason: None,
            conditions_met_at: None,
        }
    }
}

/// Owns the subscription state machine: one shared record per `(analysis, strategy)`.
pub struct SubscriptionRegistry {
    repo: SubscriptionRepository,
}

impl SubscriptionRegistry {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            repo: SubscriptionRepository::new(db),
        }
    }

    pub async fn find(&self, analysis_id: &str, strategy_id: &str) -> Result<Option<Model>> {
        self.repo.find_by_setup(analysis_id, strategy_id).await
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Model>> {
        self.repo.find_by_id(id).await
    }

    pub async fn find_by_analysis(&self, analysis_id: &str) -> Result<Vec<Model>> {
        self.repo.find_by_analysis(analysis_id).await
    }

    /// Active subscriptions still inside their validity window.
    pub async fn find_live(&self, now: DateTime<Utc>) -> Result<Vec<Model>> {
        self.repo.find_live(now).await
    }

    /// Active and not expired, or nothing.
    pub async fn active_for(&self, analysis_id: &str, strategy_id: &str) -> Result<Option<Model>> {
        let now = Utc::now();
        Ok(self
            .repo
            .find_by_setup(analysis_id, strategy_id)
            .await?
            .filter(|sub| sub.is_live(now)))
    }

    pub async fn can_start(&self, analysis_id: &str, strategy_id: &str) -> Result<CanStart> {
        let Some(sub) = self.repo.find_by_setup(analysis_id, strategy_id).await? else {
            return Ok(CanStart::allowed());
        };
        if sub.status != SubscriptionStatus::ConditionsMet {
            return Ok(CanStart::allowed());
        }
        let Some(met_at) = sub.conditions_met_at else {
            return Ok(CanStart::allowed());
        };

        let elapsed = Utc::now() - met_at;
        if elapsed <= Duration::minutes(ATTACH_WINDOW_MINUTES) {
            return Ok(CanStart {
                can_start: true,
                reason: None,
                conditions_met_at: Some(met_at),
            });
        }

        Ok(CanStart {
            can_start: false,
            reason: Some(format!(
                "Entry conditions were already met {} minutes ago. Monitoring can only be joined within {} minutes of a trigger.",
                elapsed.num_minutes(),
                ATTACH_WINDOW_MINUTES
            )),
            conditions_met_at: Some(met_at),
        })
    }

    /// Creates, resets, or joins the subscription for a setup.
    ///
    /// A concurrent creator that loses the unique-index race is retried as an update of the
    /// winner's row, so the pair never ends up with two records.
    pub async fn find_or_create(&self, req: SubscribeRequest) -> Result<Model> {
        for _ in 0..3 {
            let now = Utc::now();
            if let Some(existing) = self.repo.find_by_setup(&req.analysis_id, &req.strategy_id).await? {
                return self.join_existing(existing, &req, now).await;
            }

            match self.repo.insert(new_subscription(&req, now)).await {
                Ok(sub) => {
                    info!(
                        "✅ Created subscription {} for {}/{} (user {})",
                        sub.id, sub.analysis_id, sub.strategy_id, req.user_id
                    );
                    return Ok(sub);
                }
                Err(err) if is_unique_violation(&err) => {
                    debug!(
                        "Lost create race for {}/{}, retrying as update",
                        req.analysis_id, req.strategy_id
                    );
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(anyhow!(
            "Could not create or load subscription for {}/{}",
            req.analysis_id,
            req.strategy_id
        ))
    }

    async fn join_existing(&self, existing: Model, req: &SubscribeRequest, now: DateTime<Utc>) -> Result<Model> {
        let expired = existing.is_expired(now);

        if existing.status == SubscriptionStatus::ConditionsMet && !expired && within_attach_window(&existing, now) {
            // already triggered: the newcomer just gets the outcome
            return self.add_subscriber(existing, req, now).await;
        }

        if existing.status.is_terminal() || expired {
            return self.reset(existing, req, now).await;
        }

        self.add_subscriber(existing, req, now).await
    }

    async fn add_subscriber(&self, existing: Model, req: &SubscribeRequest, now: DateTime<Utc>) -> Result<Model> {
        let mut subscribers = existing.subscribers.clone();
        match subscribers.find_mut(req.user_id) {
            Some(subscriber) => match req.auto_order {
                Some(auto_order) if subscriber.auto_order != auto_order => subscriber.auto_order = auto_order,
                _ => return Ok(existing),
            },
            None => subscribers
                .0
                .push(Subscriber::new(req.user_id, req.auto_order.unwrap_or(false), now)),
        }

        let count = subscribers.len();
        let mut active: ActiveModel = existing.into();
        active.subscribers = ActiveValue::Set(subscribers);
        active.updated_at = ActiveValue::Set(now);
        let sub = self.repo.update(active).await?;
        debug!("Subscription {} now has {} subscriber(s)", sub.id, count);
        Ok(sub)
    }

    async fn reset(&self, existing: Model, req: &SubscribeRequest, now: DateTime<Utc>) -> Result<Model> {
        let id = existing.id;
        let previous = existing.status;
        let mut active: ActiveModel = existing.into();
        active.stock_symbol = ActiveValue::Set(req.stock.stock_symbol.clone());
        active.instrument_key = ActiveValue::Set(req.stock.instrument_key.clone());
        active.subscribers = ActiveValue::Set(Subscribers(vec![Subscriber::new(
            req.user_id,
            req.auto_order.unwrap_or(false),
            now,
        )]));
        active.status = ActiveValue::Set(SubscriptionStatus::Active);
        active.last_trigger_snapshot = ActiveValue::Set(None);
        active.conditions_met_at = ActiveValue::Set(None);
        active.notification_sent_at = ActiveValue::Set(None);
        active.stopped_at = ActiveValue::Set(None);
        active.stop_reason = ActiveValue::Set(None);
        active.expires_at = ActiveValue::Set(req.expires_at);
        active.config = ActiveValue::Set(req.config.clone());
        active.job_ref = ActiveValue::Set(req.job_ref.clone());
        active.updated_at = ActiveValue::Set(now);
        let sub = self.repo.update(active).await?;
        info!("🔄 Reset subscription {} ({:?} -> active) for user {}", id, previous, req.user_id);
        Ok(sub)
    }

    /// Moves an active subscription to `ConditionsMet` with its trigger snapshot.
    /// Returns `None` when another check got there first; the first snapshot wins.
    pub async fn mark_conditions_met(&self, sub: Model, snapshot: TriggerSnapshot) -> Result<Option<Model>> {
        let now = Utc::now();
        let changes = ActiveModel {
            status: ActiveValue::Set(SubscriptionStatus::ConditionsMet),
            conditions_met_at: ActiveValue::Set(Some(now)),
            last_trigger_snapshot: ActiveValue::Set(Some(snapshot)),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        let guard = Condition::all().add(Column::Status.eq(SubscriptionStatus::Active));
        if !self.repo.update_if(sub.id, changes, guard).await? {
            debug!("Subscription {} already left active, trigger not recorded", sub.id);
            return Ok(None);
        }
        self.repo.find_by_id(sub.id).await
    }

    pub async fn mark_notification_sent(&self, sub: Model) -> Result<Model> {
        let now = Utc::now();
        let mut active: ActiveModel = sub.into();
        active.notification_sent_at = ActiveValue::Set(Some(now));
        active.updated_at = ActiveValue::Set(now);
        self.repo.update(active).await
    }

    /// Moves the subscription into the terminal status that `reason` maps to.
    ///
    /// Only an active subscription can be stopped, except that a `ConditionsMet` stop
    /// also finalizes a row its own trigger already moved to `ConditionsMet`.
    /// Returns `None` when the row was no longer in a stoppable state.
    pub async fn stop(&self, sub: Model, reason: StopReason) -> Result<Option<Model>> {
        let now = Utc::now();
        let id = sub.id;
        let changes = ActiveModel {
            status: ActiveValue::Set(reason.terminal_status()),
            stopped_at: ActiveValue::Set(Some(now)),
            stop_reason: ActiveValue::Set(Some(reason)),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        let guard = match reason {
            StopReason::ConditionsMet => Condition::all()
                .add(Column::Status.is_in([SubscriptionStatus::Active, SubscriptionStatus::ConditionsMet]))
                .add(Column::StoppedAt.is_null()),
            _ => Condition::all().add(Column::Status.eq(SubscriptionStatus::Active)),
        };
        if !self.repo.update_if(id, changes, guard).await? {
            debug!("Subscription {} was already stopped, skipping {:?}", id, reason);
            return Ok(None);
        }
        info!("⏹ Stopped subscription {} ({:?})", id, reason);
        self.repo.find_by_id(id).await
    }

    /// Returns `None` once the last subscriber is gone and the record deleted.
    pub async fn remove_user(&self, sub: Model, user_id: i64) -> Result<Option<Model>> {
        let mut subscribers = sub.subscribers.clone();
        subscribers.0.retain(|s| s.user_id != user_id);

        if subscribers.is_empty() {
            self.repo.delete(sub.id).await?;
            info!("🗑 Deleted subscription {} after its last subscriber left", sub.id);
            return Ok(None);
        }
        if subscribers.len() == sub.subscribers.len() {
            return Ok(Some(sub));
        }

        let mut active: ActiveModel = sub.into();
        active.subscribers = ActiveValue::Set(subscribers);
        active.updated_at = ActiveValue::Set(Utc::now());
        Ok(Some(self.repo.update(active).await?))
    }

    pub async fn delete(&self, sub: Model) -> Result<bool> {
        self.repo.delete(sub.id).await
    }

    /// Pauses one subscriber, or all of them when `user_id` is `None`.
    pub async fn pause_user(&self, sub: Model, user_id: Option<i64>) -> Result<Model> {
        let now = Utc::now();
        self.set_paused(sub, user_id, Some(now)).await
    }

    pub async fn resume_user(&self, sub: Model, user_id: Option<i64>) -> Result<Model> {
        self.set_paused(sub, user_id, None).await
    }

    async fn set_paused(&self, sub: Model, user_id: Option<i64>, paused_at: Option<DateTime<Utc>>) -> Result<Model> {
        let mut subscribers = sub.subscribers.clone();
        for subscriber in subscribers.0.iter_mut() {
            if user_id.map_or(true, |u| u == subscriber.user_id) {
                subscriber.paused_at = paused_at;
            }
        }
        let mut active: ActiveModel = sub.into();
        active.subscribers = ActiveValue::Set(subscribers);
        active.updated_at = ActiveValue::Set(Utc::now());
        self.repo.update(active).await
    }

    pub async fn record_auto_order_results(
        &self,
        sub: Model,
        results: Vec<(i64, AutoOrderResult)>,
    ) -> Result<Model> {
        if results.is_empty() {
            return Ok(sub);
        }
        let now = Utc::now();
        let mut subscribers = sub.subscribers.clone();
        for (user_id, result) in results {
            if let Some(subscriber) = subscribers.find_mut(user_id) {
                subscriber.auto_order_executed_at = Some(now);
                subscriber.auto_order_result = Some(result);
            }
        }
        let mut active: ActiveModel = sub.into();
        active.subscribers = ActiveValue::Set(subscribers);
        active.updated_at = ActiveValue::Set(now);
        self.repo.update(active).await
    }

    pub async fn assign_job_refs(&self, analysis_ids: Vec<String>, job_ref: &str) -> Result<u64> {
        self.repo.assign_job_ref(analysis_ids, job_ref).await
    }

    /// Active subscriptions whose window has closed. Callers stop them one at a time.
    pub async fn due_for_expiry(&self, now: DateTime<Utc>) -> Result<Vec<Model>> {
        self.repo.find_due_for_expiry(now).await
    }

    /// Deletes terminal rows whose window closed more than `retention` ago.
    pub async fn purge_retired(&self, now: DateTime<Utc>, retention: Duration) -> Result<u64> {
        self.repo.delete_retired_before(now - retention).await
    }
}

fn within_attach_window(sub: &Model, now: DateTime<Utc>) -> bool {
    sub.conditions_met_at
        .map_or(false, |met_at| now - met_at <= Duration::minutes(ATTACH_WINDOW_MINUTES))
}

fn new_subscription(req: &SubscribeRequest, now: DateTime<Utc>) -> ActiveModel {
    ActiveModel {
        analysis_id: ActiveValue::Set(req.analysis_id.clone()),
        strategy_id: ActiveValue::Set(req.strategy_id.clone()),
        stock_symbol: ActiveValue::Set(req.stock.stock_symbol.clone()),
        instrument_key: ActiveValue::Set(req.stock.instrument_key.clone()),
        subscribers: ActiveValue::Set(Subscribers(vec![Subscriber::new(
            req.user_id,
            req.auto_order.unwrap_or(false),
            now,
        )])),
        status: ActiveValue::Set(SubscriptionStatus::Active),
        last_trigger_snapshot: ActiveValue::Set(None),
        conditions_met_at: ActiveValue::Set(None),
        notification_sent_at: ActiveValue::Set(None),
        stopped_at: ActiveValue::Set(None),
        stop_reason: ActiveValue::Set(None),
        expires_at: ActiveValue::Set(req.expires_at),
        config: ActiveValue::Set(req.config.clone()),
        job_ref: ActiveValue::Set(req.job_ref.clone()),
        created_at: ActiveValue::Set(now),
        updated_at: ActiveValue::Set(now),
        ..Default::default()
    }
}
