#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use migration::{Migrator, MigratorTrait};
use monitor::services::{
    Evaluation, EvaluationContext, HardStop, HardStopKind, MarketCalendar, Notification,
    NotificationDispatcher, OrderExecutor, TriggerEvaluator,
};
use monitor::{AppState, Collaborators, MonitorSettings};
use sea_orm::{ActiveValue, DatabaseConnection};
use shared::entity::{monitoring_subscriptions, stock_analyses};
use shared::{
    get_memory_connection, AnalysisStrategy, AutoOrderResult, EvaluatedTrigger, MonitoringConfig,
    Strategies, Subscriber, Subscribers, SubscriptionStatus, TriggerRule,
};

pub async fn setup_db() -> Arc<DatabaseConnection> {
    let db = get_memory_connection().await.expect("sqlite connection");
    Migrator::up(&db, None).await.expect("migrations");
    Arc::new(db)
}

pub struct FakeCalendar {
    pub open: AtomicBool,
    pub trading_day: AtomicBool,
}

impl FakeCalendar {
    pub fn open() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            trading_day: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl MarketCalendar for FakeCalendar {
    async fn is_market_open(&self, _at: DateTime<Utc>) -> Result<bool> {
        Ok(self.open.load(Ordering::SeqCst))
    }

    async fn is_trading_day(&self, _date: NaiveDate) -> Result<bool> {
        Ok(self.trading_day.load(Ordering::SeqCst))
    }

    async fn next_validity_cutoff(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        Ok(from + Duration::hours(6))
    }

    fn market_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.date_naive()
    }
}

#[derive(Debug, Clone)]
pub enum FakeResponse {
    Satisfied(f64),
    Pending(f64),
    HardStop(HardStopKind),
    Fail,
    Panic,
}

/// Scripted evaluator keyed by `(analysis, strategy)`; unknown setups are pending.
#[derive(Default)]
pub struct FakeEvaluator {
    pub responses: Mutex<HashMap<(String, String), FakeResponse>>,
    pub calls: AtomicUsize,
    pub cleared: Mutex<Vec<(String, String)>>,
}

impl FakeEvaluator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, analysis_id: &str, strategy_id: &str, response: FakeResponse) {
        self.responses
            .lock()
            .unwrap()
            .insert((analysis_id.to_string(), strategy_id.to_string()), response);
    }

    pub fn cleared(&self) -> Vec<(String, String)> {
        self.cleared.lock().unwrap().clone()
    }
}

fn trigger(satisfied: bool, price: f64) -> EvaluatedTrigger {
    EvaluatedTrigger {
        id: Some("t1".to_string()),
        timeframe: "15m".to_string(),
        description: "close above 152".to_string(),
        actual: Some(price),
        expected: Some(152.0),
        satisfied,
    }
}

#[async_trait]
impl TriggerEvaluator for FakeEvaluator {
    async fn evaluate(
        &self,
        analysis: &stock_analyses::Model,
        strategy: &AnalysisStrategy,
        _ctx: &EvaluationContext,
    ) -> Result<Evaluation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = self
            .responses
            .lock()
            .unwrap()
            .get(&(analysis.id.clone(), strategy.id.clone()))
            .cloned()
            .unwrap_or(FakeResponse::Pending(150.0));
        match response {
            FakeResponse::Satisfied(price) => Ok(Evaluation {
                satisfied: true,
                hard_stop: None,
                evaluated_triggers: vec![trigger(true, price)],
                current_price: price,
                timeframe_data: serde_json::json!({"15m": {"close": price}}),
            }),
            FakeResponse::Pending(price) => Ok(Evaluation {
                satisfied: false,
                hard_stop: None,
                evaluated_triggers: vec![trigger(false, price)],
                current_price: price,
                timeframe_data: serde_json::Value::Null,
            }),
            FakeResponse::HardStop(kind) => Ok(Evaluation {
                satisfied: false,
                hard_stop: Some(HardStop {
                    kind,
                    details: Some("closed below invalidation level".to_string()),
                }),
                evaluated_triggers: vec![],
                current_price: 140.0,
                timeframe_data: serde_json::Value::Null,
            }),
            FakeResponse::Fail => Err(anyhow!("market data unavailable for {}", analysis.stock_symbol)),
            FakeResponse::Panic => panic!("evaluator blew up on {}", analysis.id),
        }
    }

    async fn clear_session(&self, analysis_id: &str, strategy_id: &str) -> Result<()> {
        self.cleared
            .lock()
            .unwrap()
            .push((analysis_id.to_string(), strategy_id.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(i64, Notification)>>,
    pub unreachable: Mutex<HashSet<i64>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(i64, Notification)> {
        self.sent.lock().unwrap().clone()
    }

    /// Notifications of one kind (`metadata.type`).
    pub fn sent_of(&self, kind: &str) -> Vec<(i64, Notification)> {
        self.sent()
            .into_iter()
            .filter(|(_, n)| n.metadata["type"] == kind)
            .collect()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn notify(&self, user_id: i64, notification: &Notification) -> Result<()> {
        if self.unreachable.lock().unwrap().contains(&user_id) {
            return Err(anyhow!("user {} blocked the bot", user_id));
        }
        self.sent.lock().unwrap().push((user_id, notification.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeOrders {
    pub placed: Mutex<Vec<i64>>,
    pub fail_for: Mutex<HashSet<i64>>,
}

impl FakeOrders {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl OrderExecutor for FakeOrders {
    async fn place_conditional_order(
        &self,
        user_id: i64,
        _strategy: &AnalysisStrategy,
        _instrument_key: &str,
        _current_price: f64,
    ) -> Result<AutoOrderResult> {
        if self.fail_for.lock().unwrap().contains(&user_id) {
            return Err(anyhow!("broker rejected order for {}", user_id));
        }
        self.placed.lock().unwrap().push(user_id);
        Ok(AutoOrderResult {
            success: true,
            order_id: Some(format!("ord-{}", user_id)),
            error: None,
        })
    }
}

pub struct Harness {
    pub db: Arc<DatabaseConnection>,
    pub state: Arc<AppState>,
    pub calendar: Arc<FakeCalendar>,
    pub evaluator: Arc<FakeEvaluator>,
    pub notifier: Arc<RecordingNotifier>,
    pub orders: Arc<FakeOrders>,
}

pub async fn harness() -> Harness {
    let mut settings = MonitorSettings::default();
    settings.replan_debounce = StdDuration::from_millis(10);
    harness_with(settings).await
}

pub async fn harness_with(settings: MonitorSettings) -> Harness {
    let db = setup_db().await;
    let calendar = FakeCalendar::open();
    let evaluator = FakeEvaluator::new();
    let notifier = RecordingNotifier::new();
    let orders = FakeOrders::new();
    let state = AppState::assemble(
        db.clone(),
        settings,
        Collaborators {
            calendar: calendar.clone(),
            evaluator: evaluator.clone(),
            notifier: notifier.clone(),
            orders: orders.clone(),
        },
    )
    .await;
    Harness {
        db,
        state,
        calendar,
        evaluator,
        notifier,
        orders,
    }
}

pub fn strategy(id: &str) -> AnalysisStrategy {
    AnalysisStrategy {
        id: id.to_string(),
        name: format!("Breakout {}", id),
        kind: "BUY".to_string(),
        entry: Some(152.0),
        target: Some(160.0),
        stop_loss: Some(148.0),
        triggers: vec![TriggerRule {
            id: Some("t1".to_string()),
            timeframe: "15m".to_string(),
            left: "close".to_string(),
            op: ">".to_string(),
            right: serde_json::json!(152.0),
        }],
        invalidations: vec![],
    }
}

pub async fn seed_analysis(h: &Harness, id: &str, strategy_ids: &[&str]) -> stock_analyses::Model {
    let now = Utc::now();
    h.state
        .analyses
        .create(stock_analyses::ActiveModel {
            id: ActiveValue::Set(id.to_string()),
            user_id: ActiveValue::Set(1),
            stock_symbol: ActiveValue::Set(format!("SYM{}", id.to_uppercase())),
            instrument_key: ActiveValue::Set(format!("NSE_EQ|{}", id)),
            strategies: ActiveValue::Set(Strategies(strategy_ids.iter().map(|s| strategy(s)).collect())),
            valid_until: ActiveValue::Set(now + Duration::days(2)),
            orders_placed: ActiveValue::Set(false),
            order_placement_in_progress: ActiveValue::Set(false),
            order_placement_started_at: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        })
        .await
        .expect("seed analysis")
}

pub fn subscribe_request(analysis_id: &str, strategy_id: &str, user_id: i64) -> monitor::services::SubscribeRequest {
    monitor::services::SubscribeRequest {
        analysis_id: analysis_id.to_string(),
        strategy_id: strategy_id.to_string(),
        user_id,
        stock: monitor::services::StockInfo {
            stock_symbol: "TCS".to_string(),
            instrument_key: "NSE_EQ|TCS".to_string(),
        },
        job_ref: None,
        config: MonitoringConfig::default(),
        auto_order: None,
        expires_at: Utc::now() + Duration::hours(6),
    }
}

/// Subscription row written directly, for states the public API cannot reach quickly.
pub async fn insert_subscription(
    db: &DatabaseConnection,
    analysis_id: &str,
    strategy_id: &str,
    user_ids: &[i64],
    status: SubscriptionStatus,
    expires_at: DateTime<Utc>,
) -> monitoring_subscriptions::Model {
    use sea_orm::ActiveModelTrait;
    let now = Utc::now();
    monitoring_subscriptions::ActiveModel {
        analysis_id: ActiveValue::Set(analysis_id.to_string()),
        strategy_id: ActiveValue::Set(strategy_id.to_string()),
        stock_symbol: ActiveValue::Set("TCS".to_string()),
        instrument_key: ActiveValue::Set("NSE_EQ|TCS".to_string()),
        subscribers: ActiveValue::Set(Subscribers(
            user_ids.iter().map(|&u| Subscriber::new(u, false, now)).collect(),
        )),
        status: ActiveValue::Set(status),
        last_trigger_snapshot: ActiveValue::Set(None),
        conditions_met_at: ActiveValue::Set(None),
        notification_sent_at: ActiveValue::Set(None),
        stopped_at: ActiveValue::Set(None),
        stop_reason: ActiveValue::Set(None),
        expires_at: ActiveValue::Set(expires_at),
        config: ActiveValue::Set(MonitoringConfig::default()),
        job_ref: ActiveValue::Set(None),
        created_at: ActiveValue::Set(now),
        updated_at: ActiveValue::Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("insert subscription")
}
