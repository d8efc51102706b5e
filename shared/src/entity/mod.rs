//! `SeaORM` entities for the monitoring tables.

pub mod prelude;

pub mod monitoring_audit_logs;
pub mod monitoring_jobs;
pub mod monitoring_subscriptions;
pub mod stock_analyses;
