use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder,
};
use shared::entity::monitoring_subscriptions::{self, ActiveModel, Column, Entity, Model};
use shared::SubscriptionStatus;

pub struct SubscriptionRepository {
    db: Arc<DatabaseConnection>,
}

impl SubscriptionRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Model>> {
        let sub = Entity::find_by_id(id).one(self.db.as_ref()).await?;
        Ok(sub)
    }

    pub async fn find_by_setup(&self, analysis_id: &str, strategy_id: &str) -> Result<Option<Model>> {
        let sub = Entity::find()
            .filter(Column::AnalysisId.eq(analysis_id))
            .filter(Column::StrategyId.eq(strategy_id))
            .one(self.db.as_ref())
            .await?;
        Ok(sub)
    }

    pub async fn find_by_analysis(&self, analysis_id: &str) -> Result<Vec<Model>> {
        let subs = Entity::find()
            .filter(Column::AnalysisId.eq(analysis_id))
            .order_by_asc(Column::Id)
            .all(self.db.as_ref())
            .await?;
        Ok(subs)
    }

    /// Active subscriptions whose validity window is still open.
    pub async fn find_live(&self, now: DateTime<Utc>) -> Result<Vec<Model>> {
        let subs = Entity::find()
            .filter(Column::Status.eq(SubscriptionStatus::Active))
            .filter(Column::ExpiresAt.gt(now))
            .order_by_asc(Column::Id)
            .all(self.db.as_ref())
            .await?;
        Ok(subs)
    }

    /// Active subscriptions whose validity window has closed.
    pub async fn find_due_for_expiry(&self, now: DateTime<Utc>) -> Result<Vec<Model>> {
        let subs = Entity::find()
            .filter(Column::Status.eq(SubscriptionStatus::Active))
            .filter(Column::ExpiresAt.lte(now))
            .all(self.db.as_ref())
            .await?;
        Ok(subs)
    }

    /// Raw insert so callers can tell a unique-index race apart from other failures.
    pub async fn insert(&self, active_model: ActiveModel) -> Result<Model, DbErr> {
        active_model.insert(self.db.as_ref()).await
    }

    pub async fn update(&self, active_model: ActiveModel) -> Result<Model> {
        let sub = active_model.update(self.db.as_ref()).await?;
        Ok(sub)
    }

    /// Writes the `Set` fields of `changes` only while row `id` still matches `guard`.
    /// Returns whether this call made the change.
    pub async fn update_if(&self, id: i64, changes: ActiveModel, guard: Condition) -> Result<bool> {
        let res = Entity::update_many()
            .set(changes)
            .filter(Column::Id.eq(id))
            .filter(guard)
            .exec(self.db.as_ref())
            .await?;
        Ok(res.rows_affected == 1)
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let res = Entity::delete_by_id(id).exec(self.db.as_ref()).await?;
        Ok(res.rows_affected > 0)
    }

    /// Tags every active subscription of the given analyses with the batch that checks them.
    pub async fn assign_job_ref(&self, analysis_ids: Vec<String>, job_ref: &str) -> Result<u64> {
        if analysis_ids.is_empty() {
            return Ok(0);
        }
        let res = Entity::update_many()
            .col_expr(Column::JobRef, Expr::value(job_ref))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Status.eq(SubscriptionStatus::Active))
            .filter(Column::AnalysisId.is_in(analysis_ids))
            .exec(self.db.as_ref())
            .await?;
        Ok(res.rows_affected)
    }

    /// Deletes terminal rows whose `expires_at` is older than `cutoff`.
    pub async fn delete_retired_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let res = monitoring_subscriptions::Entity::delete_many()
            .filter(Column::Status.ne(SubscriptionStatus::Active))
            .filter(Column::ExpiresAt.lt(cutoff))
            .exec(self.db.as_ref())
            .await?;
        Ok(res.rows_affected)
    }
}
