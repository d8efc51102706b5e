pub use super::monitoring_audit_logs::Entity as MonitoringAuditLogs;
pub use super::monitoring_jobs::Entity as MonitoringJobs;
pub use super::monitoring_subscriptions::Entity as MonitoringSubscriptions;
pub use super::stock_analyses::Entity as StockAnalyses;
