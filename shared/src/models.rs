//! Domain types stored in JSON columns or as string enums.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};

/// Lifecycle of a monitoring subscription. `Active` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "conditions_met")]
    ConditionsMet,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "invalidated")]
    Invalidated,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl SubscriptionStatus {
    pub fn is_terminal(self) -> bool {
        self != SubscriptionStatus::Active
    }
}

/// Why monitoring of a setup stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[sea_orm(string_value = "conditions_met")]
    ConditionsMet,
    #[sea_orm(string_value = "invalidated")]
    Invalidated,
    #[sea_orm(string_value = "entry_window_elapsed")]
    EntryWindowElapsed,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "user_cancelled")]
    UserCancelled,
    #[sea_orm(string_value = "analysis_missing")]
    AnalysisMissing,
    #[sea_orm(string_value = "strategy_missing")]
    StrategyMissing,
    #[sea_orm(string_value = "analysis_expired")]
    AnalysisExpired,
    #[sea_orm(string_value = "orders_placed")]
    OrdersPlaced,
    #[sea_orm(string_value = "order_in_progress")]
    OrderInProgress,
}

impl StopReason {
    /// Terminal status a subscription lands in when stopped for this reason.
    pub fn terminal_status(self) -> SubscriptionStatus {
        match self {
            StopReason::ConditionsMet => SubscriptionStatus::ConditionsMet,
            StopReason::Invalidated | StopReason::EntryWindowElapsed => SubscriptionStatus::Invalidated,
            StopReason::Expired => SubscriptionStatus::Expired,
            StopReason::UserCancelled
            | StopReason::AnalysisMissing
            | StopReason::StrategyMissing
            | StopReason::AnalysisExpired
            | StopReason::OrdersPlaced
            | StopReason::OrderInProgress => SubscriptionStatus::Cancelled,
        }
    }

    /// Audit category recorded for every subscriber when a stop happens.
    pub fn audit_status(self) -> AuditStatus {
        match self.terminal_status() {
            SubscriptionStatus::ConditionsMet => AuditStatus::Triggered,
            SubscriptionStatus::Invalidated => AuditStatus::Invalidated,
            SubscriptionStatus::Expired => AuditStatus::Expired,
            SubscriptionStatus::Active | SubscriptionStatus::Cancelled => AuditStatus::Cancelled,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            StopReason::ConditionsMet => "Entry conditions were met",
            StopReason::Invalidated => "The setup was invalidated",
            StopReason::EntryWindowElapsed => "The entry window elapsed without a trigger",
            StopReason::Expired => "Monitoring window expired",
            StopReason::UserCancelled => "Monitoring was stopped by the user",
            StopReason::AnalysisMissing => "The analysis no longer exists",
            StopReason::StrategyMissing => "The strategy no longer exists in the analysis",
            StopReason::AnalysisExpired => "The analysis has expired",
            StopReason::OrdersPlaced => "Orders were already placed for this analysis",
            StopReason::OrderInProgress => "Order placement is in progress for this analysis",
        }
    }
}

/// Outcome category of one audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    #[sea_orm(string_value = "triggered")]
    Triggered,
    #[sea_orm(string_value = "not_triggered")]
    NotTriggered,
    #[sea_orm(string_value = "invalidated")]
    Invalidated,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "skipped")]
    Skipped,
    #[sea_orm(string_value = "error")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoOrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub user_id: i64,
    pub subscribed_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auto_order: bool,
    pub auto_order_executed_at: Option<DateTime<Utc>>,
    pub auto_order_result: Option<AutoOrderResult>,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
}

impl Subscriber {
    pub fn new(user_id: i64, auto_order: bool, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            subscribed_at: now,
            acknowledged_at: None,
            auto_order,
            auto_order_executed_at: None,
            auto_order_result: None,
            paused_at: None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default, FromJsonQueryResult)]
pub struct Subscribers(pub Vec<Subscriber>);

impl Subscribers {
    pub fn find(&self, user_id: i64) -> Option<&Subscriber> {
        self.0.iter().find(|s| s.user_id == user_id)
    }

    pub fn find_mut(&mut self, user_id: i64) -> Option<&mut Subscriber> {
        self.0.iter_mut().find(|s| s.user_id == user_id)
    }

    pub fn user_ids(&self) -> Vec<i64> {
        self.0.iter().map(|s| s.user_id).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn all_paused(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(Subscriber::is_paused)
    }
}

/// Cadence and timeframes a subscriber asked for. Only a planning hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct MonitoringConfig {
    pub frequency_seconds: u32,
    #[serde(default)]
    pub timeframes: Vec<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            frequency_seconds: 900,
            timeframes: vec!["15m".to_string(), "1h".to_string()],
        }
    }
}

/// One trigger condition as the evaluator saw it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedTrigger {
    pub id: Option<String>,
    pub timeframe: String,
    pub description: String,
    pub actual: Option<f64>,
    pub expected: Option<f64>,
    pub satisfied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MarketConditions {
    pub current_price: f64,
    pub triggers_met: usize,
    pub triggers_total: usize,
    pub timeframes: Vec<String>,
}

/// Audit record written once, when a subscription transitions into `ConditionsMet`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct TriggerSnapshot {
    pub price: f64,
    pub timeframe_data: serde_json::Value,
    pub evaluated_triggers: Vec<EvaluatedTrigger>,
    pub market_conditions: MarketConditions,
    pub captured_at: DateTime<Utc>,
}

/// A rule the trigger evaluator understands, e.g. `close > 152.0` on `15m`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRule {
    pub id: Option<String>,
    pub timeframe: String,
    pub left: String,
    pub op: String,
    pub right: serde_json::Value,
}

/// A concrete entry/target/stop plan inside an analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStrategy {
    pub id: String,
    pub name: String,
    /// "BUY" or "SELL"
    pub kind: String,
    pub entry: Option<f64>,
    pub target: Option<f64>,
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub triggers: Vec<TriggerRule>,
    #[serde(default)]
    pub invalidations: Vec<TriggerRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default, FromJsonQueryResult)]
pub struct Strategies(pub Vec<AnalysisStrategy>);

impl Strategies {
    pub fn find(&self, strategy_id: &str) -> Option<&AnalysisStrategy> {
        self.0.iter().find(|s| s.id == strategy_id)
    }
}

/// When a persisted job definition fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSchedule {
    /// Fixed cadence, measured from the end of the previous run.
    Every { seconds: u64 },
    /// Once a day at a wall-clock time in the market timezone.
    DailyAt { hour: u32, minute: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_reason_terminal_mapping() {
        assert_eq!(StopReason::ConditionsMet.terminal_status(), SubscriptionStatus::ConditionsMet);
        assert_eq!(StopReason::Invalidated.terminal_status(), SubscriptionStatus::Invalidated);
        assert_eq!(StopReason::EntryWindowElapsed.terminal_status(), SubscriptionStatus::Invalidated);
        assert_eq!(StopReason::Expired.terminal_status(), SubscriptionStatus::Expired);
        assert_eq!(StopReason::UserCancelled.terminal_status(), SubscriptionStatus::Cancelled);
        assert_eq!(StopReason::AnalysisMissing.terminal_status(), SubscriptionStatus::Cancelled);
        assert_eq!(StopReason::OrderInProgress.terminal_status(), SubscriptionStatus::Cancelled);
    }

    #[test]
    fn test_subscribers_all_paused() {
        let now = Utc::now();
        let mut subs = Subscribers(vec![Subscriber::new(1, false, now), Subscriber::new(2, true, now)]);
        assert!(!subs.all_paused());
        for s in subs.0.iter_mut() {
            s.paused_at = Some(now);
        }
        assert!(subs.all_paused());
        assert!(!Subscribers::default().all_paused());
    }

    #[test]
    fn test_job_schedule_json_shape() {
        let json = serde_json::to_value(JobSchedule::Every { seconds: 900 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "every", "seconds": 900}));
    }
}
