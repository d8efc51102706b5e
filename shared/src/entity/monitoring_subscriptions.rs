//! `SeaORM` Entity, @generated manually

use sea_orm::entity::prelude::*;

use crate::models::{MonitoringConfig, StopReason, Subscribers, SubscriptionStatus, TriggerSnapshot};

/// One row per `(analysis_id, strategy_id)`; the pair is a unique index.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "monitoring_subscriptions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub analysis_id: String,
    pub strategy_id: String,
    pub stock_symbol: String,
    pub instrument_key: String,
    #[sea_orm(column_type = "Json")]
    pub subscribers: Subscribers,
    pub status: SubscriptionStatus,
    #[sea_orm(column_type = "Json", nullable)]
    pub last_trigger_snapshot: Option<TriggerSnapshot>,
    pub conditions_met_at: Option<DateTimeUtc>,
    pub notification_sent_at: Option<DateTimeUtc>,
    pub stopped_at: Option<DateTimeUtc>,
    pub stop_reason: Option<StopReason>,
    pub expires_at: DateTimeUtc,
    #[sea_orm(column_type = "Json")]
    pub config: MonitoringConfig,
    pub job_ref: Option<String>, // batch id of the job currently checking this row
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_expired(&self, now: DateTimeUtc) -> bool {
        self.expires_at <= now
    }

    /// Active and inside its validity window.
    pub fn is_live(&self, now: DateTimeUtc) -> bool {
        self.status == SubscriptionStatus::Active && !self.is_expired(now)
    }
}
