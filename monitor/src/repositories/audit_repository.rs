use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use sea_orm::{ActiveValue, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use serde_json::Value;
use shared::entity::monitoring_audit_logs::{ActiveModel, Column, Entity, Model};
use shared::AuditStatus;

/// One check outcome for one user.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub analysis_id: String,
    pub strategy_id: String,
    pub user_id: i64,
    pub status: AuditStatus,
    pub reason: Option<String>,
    pub details: Option<Value>,
    pub duration_ms: Option<i64>,
}

impl AuditEntry {
    /// The same outcome fanned out to every listed user.
    pub fn for_users(
        analysis_id: &str,
        strategy_id: &str,
        user_ids: &[i64],
        status: AuditStatus,
        reason: Option<String>,
        details: Option<Value>,
        duration_ms: Option<i64>,
    ) -> Vec<AuditEntry> {
        user_ids
            .iter()
            .map(|&user_id| AuditEntry {
                analysis_id: analysis_id.to_string(),
                strategy_id: strategy_id.to_string(),
                user_id,
                status,
                reason: reason.clone(),
                details: details.clone(),
                duration_ms,
            })
            .collect()
    }

    fn into_active_model(self) -> ActiveModel {
        ActiveModel {
            analysis_id: ActiveValue::Set(self.analysis_id),
            strategy_id: ActiveValue::Set(self.strategy_id),
            user_id: ActiveValue::Set(self.user_id),
            status: ActiveValue::Set(self.status),
            reason: ActiveValue::Set(self.reason),
            details: ActiveValue::Set(self.details),
            duration_ms: ActiveValue::Set(self.duration_ms),
            created_at: ActiveValue::Set(Utc::now()),
            ..Default::default()
        }
    }
}

/// Append-only audit sink.
pub struct AuditRepository {
    db: Arc<DatabaseConnection>,
}

impl AuditRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn record(&self, entries: Vec<AuditEntry>) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let count = entries.len();
        Entity::insert_many(entries.into_iter().map(AuditEntry::into_active_model))
            .exec(self.db.as_ref())
            .await?;
        Ok(count)
    }

    pub async fn find_for_setup(&self, analysis_id: &str, strategy_id: &str) -> Result<Vec<Model>> {
        let rows = Entity::find()
            .filter(Column::AnalysisId.eq(analysis_id))
            .filter(Column::StrategyId.eq(strategy_id))
            .order_by_asc(Column::Id)
            .all(self.db.as_ref())
            .await?;
        Ok(rows)
    }

    pub async fn find_by_status(&self, status: AuditStatus) -> Result<Vec<Model>> {
        let rows = Entity::find()
            .filter(Column::Status.eq(status))
            .order_by_asc(Column::Id)
            .all(self.db.as_ref())
            .await?;
        Ok(rows)
    }
}
