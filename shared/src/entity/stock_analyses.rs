//! `SeaORM` Entity, @generated manually

use sea_orm::entity::prelude::*;

use crate::models::Strategies;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "stock_analyses")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub user_id: i64,
    pub stock_symbol: String,
    pub instrument_key: String,
    #[sea_orm(column_type = "Json")]
    pub strategies: Strategies,
    pub valid_until: DateTimeUtc,
    pub orders_placed: bool,
    pub order_placement_in_progress: bool,
    pub order_placement_started_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
