use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, Condition, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect,
};
use serde_json::Value;
use shared::entity::monitoring_jobs::{ActiveModel, Column, Entity, Model};
use shared::JobSchedule;

use super::is_unique_violation;

/// Durable store of job definitions, keyed by `(name, job_key)`.
pub struct JobRepository {
    db: Arc<DatabaseConnection>,
}

impl JobRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find(&self, name: &str, job_key: &str) -> Result<Option<Model>> {
        let job = Entity::find()
            .filter(Column::Name.eq(name))
            .filter(Column::JobKey.eq(job_key))
            .one(self.db.as_ref())
            .await?;
        Ok(job)
    }

    pub async fn list_by_name(&self, name: &str) -> Result<Vec<Model>> {
        let jobs = Entity::find()
            .filter(Column::Name.eq(name))
            .order_by_asc(Column::Id)
            .all(self.db.as_ref())
            .await?;
        Ok(jobs)
    }

    /// Creates the definition or replaces its payload and schedule.
    ///
    /// An existing definition's next run is moved to `next_run_at` only when `reschedule`
    /// is set. Its lock is never touched.
    pub async fn upsert(
        &self,
        name: &str,
        job_key: &str,
        payload: Value,
        schedule: JobSchedule,
        next_run_at: DateTime<Utc>,
        reschedule: bool,
    ) -> Result<Model> {
        let moved_run = reschedule.then_some(next_run_at);
        if let Some(existing) = self.find(name, job_key).await? {
            return self.replace(existing, payload, schedule, moved_run).await;
        }

        let now = Utc::now();
        let job = ActiveModel {
            name: ActiveValue::Set(name.to_string()),
            job_key: ActiveValue::Set(job_key.to_string()),
            payload: ActiveValue::Set(payload.clone()),
            schedule: ActiveValue::Set(schedule.clone()),
            next_run_at: ActiveValue::Set(next_run_at),
            locked_at: ActiveValue::Set(None),
            locked_by: ActiveValue::Set(None),
            last_run_at: ActiveValue::Set(None),
            last_finished_at: ActiveValue::Set(None),
            fail_count: ActiveValue::Set(0),
            last_error: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };

        match job.insert(self.db.as_ref()).await {
            Ok(model) => Ok(model),
            Err(err) if is_unique_violation(&err) => {
                // another process created it between our read and insert
                let existing = self
                    .find(name, job_key)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Job {}/{} vanished during upsert", name, job_key))?;
                self.replace(existing, payload, schedule, moved_run).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn replace(
        &self,
        existing: Model,
        payload: Value,
        schedule: JobSchedule,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<Model> {
        let mut job: ActiveModel = existing.into();
        job.payload = ActiveValue::Set(payload);
        job.schedule = ActiveValue::Set(schedule);
        if let Some(next_run_at) = next_run_at {
            job.next_run_at = ActiveValue::Set(next_run_at);
        }
        job.updated_at = ActiveValue::Set(Utc::now());
        let model = job.update(self.db.as_ref()).await?;
        Ok(model)
    }

    pub async fn delete_by_name(&self, name: &str) -> Result<u64> {
        let res = Entity::delete_many()
            .filter(Column::Name.eq(name))
            .exec(self.db.as_ref())
            .await?;
        Ok(res.rows_affected)
    }

    pub async fn delete(&self, name: &str, job_key: &str) -> Result<u64> {
        let res = Entity::delete_many()
            .filter(Column::Name.eq(name))
            .filter(Column::JobKey.eq(job_key))
            .exec(self.db.as_ref())
            .await?;
        Ok(res.rows_affected)
    }

    /// Due definitions that are unlocked or whose lock has gone stale, oldest first.
    pub async fn find_due(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Model>> {
        let jobs = Entity::find()
            .filter(Column::NextRunAt.lte(now))
            .filter(unlocked_or_stale(stale_before))
            .order_by_asc(Column::NextRunAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;
        Ok(jobs)
    }

    /// Conditional lock; only one process wins a given definition.
    pub async fn try_lock(
        &self,
        id: i64,
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let res = Entity::update_many()
            .col_expr(Column::LockedAt, Expr::value(Some(now)))
            .col_expr(Column::LockedBy, Expr::value(Some(owner.to_string())))
            .col_expr(Column::LastRunAt, Expr::value(Some(now)))
            .filter(Column::Id.eq(id))
            .filter(unlocked_or_stale(stale_before))
            .exec(self.db.as_ref())
            .await?;
        Ok(res.rows_affected == 1)
    }

    /// Releases the lock and records the run outcome.
    pub async fn complete(
        &self,
        id: i64,
        next_run_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<()> {
        let failed = error.is_some();
        let mut update = Entity::update_many()
            .col_expr(Column::LockedAt, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(Column::LockedBy, Expr::value(Option::<String>::None))
            .col_expr(Column::LastFinishedAt, Expr::value(Some(finished_at)))
            .col_expr(Column::NextRunAt, Expr::value(next_run_at))
            .col_expr(Column::LastError, Expr::value(error))
            .col_expr(Column::UpdatedAt, Expr::value(finished_at));
        update = if failed {
            update.col_expr(Column::FailCount, Expr::col(Column::FailCount).add(1))
        } else {
            update.col_expr(Column::FailCount, Expr::value(0))
        };
        update.filter(Column::Id.eq(id)).exec(self.db.as_ref()).await?;
        Ok(())
    }

    /// Frees locks left behind by a process that died mid-run.
    pub async fn release_stale_locks(&self, stale_before: DateTime<Utc>) -> Result<u64> {
        let res = Entity::update_many()
            .col_expr(Column::LockedAt, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(Column::LockedBy, Expr::value(Option::<String>::None))
            .filter(Column::LockedAt.is_not_null())
            .filter(Column::LockedAt.lt(stale_before))
            .exec(self.db.as_ref())
            .await?;
        Ok(res.rows_affected)
    }

    /// Frees every lock held by `owner` (used on graceful shutdown).
    pub async fn release_locks_of(&self, owner: &str) -> Result<u64> {
        let res = Entity::update_many()
            .col_expr(Column::LockedAt, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(Column::LockedBy, Expr::value(Option::<String>::None))
            .filter(Column::LockedBy.eq(owner))
            .exec(self.db.as_ref())
            .await?;
        Ok(res.rows_affected)
    }
}

fn unlocked_or_stale(stale_before: DateTime<Utc>) -> Condition {
    Condition::any()
        .add(Column::LockedAt.is_null())
        .add(Column::LockedAt.lt(stale_before))
}
