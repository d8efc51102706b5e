use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter};
use shared::entity::stock_analyses::{ActiveModel, Column, Entity, Model};

pub struct AnalysisRepository {
    db: Arc<DatabaseConnection>,
}

impl AnalysisRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, analysis_id: &str) -> Result<Option<Model>> {
        let analysis = Entity::find_by_id(analysis_id.to_string())
            .one(self.db.as_ref())
            .await?;
        Ok(analysis)
    }

    pub async fn create(&self, active_model: ActiveModel) -> Result<Model> {
        let analysis = active_model.insert(self.db.as_ref()).await?;
        Ok(analysis)
    }

    /// Claims the order-placement flag. A flag set before `stale_before` counts as abandoned.
    /// Nothing is claimed once orders were placed for the analysis.
    pub async fn try_begin_order_placement(
        &self,
        analysis_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let res = Entity::update_many()
            .col_expr(Column::OrderPlacementInProgress, Expr::value(true))
            .col_expr(Column::OrderPlacementStartedAt, Expr::value(Some(now)))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(analysis_id))
            .filter(Column::OrdersPlaced.eq(false))
            .filter(
                Condition::any()
                    .add(Column::OrderPlacementInProgress.eq(false))
                    .add(Column::OrderPlacementStartedAt.is_null())
                    .add(Column::OrderPlacementStartedAt.lt(stale_before)),
            )
            .exec(self.db.as_ref())
            .await?;
        Ok(res.rows_affected == 1)
    }

    pub async fn clear_order_placement(&self, analysis_id: &str) -> Result<()> {
        Entity::update_many()
            .col_expr(Column::OrderPlacementInProgress, Expr::value(false))
            .col_expr(Column::OrderPlacementStartedAt, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Id.eq(analysis_id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Releases a claimed flag, marking the analysis as having orders when `orders_placed`.
    pub async fn finish_order_placement(&self, analysis_id: &str, orders_placed: bool) -> Result<()> {
        let mut update = Entity::update_many()
            .col_expr(Column::OrderPlacementInProgress, Expr::value(false))
            .col_expr(Column::OrderPlacementStartedAt, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()));
        if orders_placed {
            update = update.col_expr(Column::OrdersPlaced, Expr::value(true));
        }
        update.filter(Column::Id.eq(analysis_id)).exec(self.db.as_ref()).await?;
        Ok(())
    }

    /// Clears every in-progress flag set before `stale_before`. Returns how many were reclaimed.
    pub async fn clear_stale_order_flags(&self, stale_before: DateTime<Utc>) -> Result<u64> {
        let res = Entity::update_many()
            .col_expr(Column::OrderPlacementInProgress, Expr::value(false))
            .col_expr(Column::OrderPlacementStartedAt, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::OrderPlacementInProgress.eq(true))
            .filter(
                Condition::any()
                    .add(Column::OrderPlacementStartedAt.is_null())
                    .add(Column::OrderPlacementStartedAt.lt(stale_before)),
            )
            .exec(self.db.as_ref())
            .await?;
        Ok(res.rows_affected)
    }
}
