//! `SeaORM` Entity, @generated manually

use sea_orm::entity::prelude::*;

use crate::models::AuditStatus;

/// Append-only: one row per check outcome, per user, per strategy.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "monitoring_audit_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub analysis_id: String,
    pub strategy_id: String,
    pub user_id: i64,
    pub status: AuditStatus,
    #[sea_orm(column_type = "Text", nullable)]
    pub reason: Option<String>,
    #[sea_orm(column_type = "Json", nullable)]
    pub details: Option<Json>, // evaluated values at check time
    pub duration_ms: Option<i64>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
