//! `SeaORM` Entity, @generated manually

use sea_orm::entity::prelude::*;

use crate::models::JobSchedule;

/// Persistent job definition. `(name, job_key)` is unique.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "monitoring_jobs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub job_key: String,
    #[sea_orm(column_type = "Json")]
    pub payload: Json,
    #[sea_orm(column_type = "Json")]
    pub schedule: JobSchedule,
    pub next_run_at: DateTimeUtc,
    pub locked_at: Option<DateTimeUtc>,
    pub locked_by: Option<String>,
    pub last_run_at: Option<DateTimeUtc>,
    pub last_finished_at: Option<DateTimeUtc>,
    pub fail_count: i32,
    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
