//! Caller-facing failures of the monitoring operations.

use thiserror::Error;

/// Every variant's `Display` is the reason string handed back to the caller.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Analysis {0} not found")]
    AnalysisNotFound(String),

    #[error("Strategy {strategy_id} not found in analysis {analysis_id}")]
    StrategyNotFound {
        analysis_id: String,
        strategy_id: String,
    },

    #[error("Analysis has expired, monitoring is no longer possible")]
    AnalysisExpired,

    #[error("Orders have already been placed for this analysis")]
    OrdersAlreadyPlaced,

    #[error("{0}")]
    CannotStart(String),

    #[error("No active monitoring found for this setup")]
    NotMonitoring,

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<sea_orm::DbErr> for MonitorError {
    fn from(err: sea_orm::DbErr) -> Self {
        MonitorError::Internal(err.into())
    }
}

impl MonitorError {
    /// Stable code for logs and audit rows.
    pub fn code(&self) -> &'static str {
        match self {
            MonitorError::Validation(_) => "VALIDATION_ERROR",
            MonitorError::AnalysisNotFound(_) => "ANALYSIS_NOT_FOUND",
            MonitorError::StrategyNotFound { .. } => "STRATEGY_NOT_FOUND",
            MonitorError::AnalysisExpired => "ANALYSIS_EXPIRED",
            MonitorError::OrdersAlreadyPlaced => "ORDERS_ALREADY_PLACED",
            MonitorError::CannotStart(_) => "CANNOT_START",
            MonitorError::NotMonitoring => "NOT_MONITORING",
            MonitorError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Validation and policy failures are the caller's to fix; only internal ones are ours.
    pub fn is_internal(&self) -> bool {
        matches!(self, MonitorError::Internal(_))
    }
}
