pub mod analysis_repository;
pub mod audit_repository;
pub mod job_repository;
pub mod subscription_repository;

pub use analysis_repository::AnalysisRepository;
pub use audit_repository::{AuditEntry, AuditRepository};
pub use job_repository::JobRepository;
pub use subscription_repository::SubscriptionRepository;

use sea_orm::{DbErr, SqlErr};

/// True when the error is a UNIQUE index violation (MySQL 1062, SQLite 2067).
pub fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}
