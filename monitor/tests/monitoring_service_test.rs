mod common;

use chrono::{Duration, Utc};
use common::{harness, insert_subscription, seed_analysis, strategy, FakeResponse, Harness};
use monitor::services::monitoring_service::StartMonitoringResult;
use monitor::services::{ClientState, StartOptions};
use monitor::MonitorError;
use sea_orm::{ActiveModelTrait, ActiveValue};
use shared::entity::stock_analyses;
use shared::{AuditStatus, Strategies, SubscriptionStatus};

async fn start(h: &Harness, analysis_id: &str, strategy_id: &str, user_id: i64) -> Result<StartMonitoringResult, MonitorError> {
    h.state
        .monitoring
        .start_monitoring(analysis_id, strategy_id, user_id, 900, StartOptions::default())
        .await
}

#[tokio::test]
async fn test_start_creates_subscription_bounded_by_validity() {
    let h = harness().await;
    seed_analysis(&h, "a1", &["s1"]).await;

    let before = Utc::now();
    let res = start(&h, "a1", "s1", 42).await.unwrap();
    assert_eq!(res.subscriber_count, 1);
    assert!(!res.already_triggered);
    // the fake calendar closes the window six hours out, well before valid_until
    assert!(res.expires_at > before + Duration::hours(6) - Duration::seconds(1));
    assert!(res.expires_at <= Utc::now() + Duration::hours(6));

    let sub = h.state.registry.find_by_id(res.subscription_id).await.unwrap().unwrap();
    assert_eq!(sub.stock_symbol, "SYMA1");
    assert_eq!(sub.config.frequency_seconds, 900);
    assert_eq!(sub.config.timeframes, vec!["15m".to_string()]);

    let again = start(&h, "a1", "s1", 43).await.unwrap();
    assert_eq!(again.subscription_id, res.subscription_id);
    assert_eq!(again.subscriber_count, 2);
}

#[tokio::test]
async fn test_expiry_capped_by_analysis_validity() {
    let h = harness().await;
    let analysis = seed_analysis(&h, "a1", &["s1"]).await;
    let valid_until = Utc::now() + Duration::hours(1);
    let mut active: stock_analyses::ActiveModel = analysis.into();
    active.valid_until = ActiveValue::Set(valid_until);
    active.update(h.db.as_ref()).await.unwrap();

    let res = start(&h, "a1", "s1", 1).await.unwrap();
    assert_eq!(res.expires_at.timestamp(), valid_until.timestamp());
}

#[tokio::test]
async fn test_start_rejects_invalid_requests() {
    let h = harness().await;
    seed_analysis(&h, "a1", &["s1"]).await;

    assert!(matches!(start(&h, "", "s1", 1).await, Err(MonitorError::Validation(_))));
    assert!(matches!(start(&h, "a1", "s 1", 1).await, Err(MonitorError::Validation(_))));
    assert!(matches!(
        h.state.monitoring.start_monitoring("a1", "s1", 1, 30, StartOptions::default()).await,
        Err(MonitorError::Validation(_))
    ));
    assert!(matches!(
        h.state.monitoring.start_monitoring("a1", "s1", 1, 90_000, StartOptions::default()).await,
        Err(MonitorError::Validation(_))
    ));
    assert!(matches!(start(&h, "missing", "s1", 1).await, Err(MonitorError::AnalysisNotFound(_))));
    assert!(matches!(start(&h, "a1", "s9", 1).await, Err(MonitorError::StrategyNotFound { .. })));
}

#[tokio::test]
async fn test_start_rejects_unmonitorable_analyses() {
    let h = harness().await;

    let expired = seed_analysis(&h, "old", &["s1"]).await;
    let mut active: stock_analyses::ActiveModel = expired.into();
    active.valid_until = ActiveValue::Set(Utc::now() - Duration::minutes(1));
    active.update(h.db.as_ref()).await.unwrap();
    assert!(matches!(start(&h, "old", "s1", 1).await, Err(MonitorError::AnalysisExpired)));

    let ordered = seed_analysis(&h, "done", &["s1"]).await;
    let mut active: stock_analyses::ActiveModel = ordered.into();
    active.orders_placed = ActiveValue::Set(true);
    active.update(h.db.as_ref()).await.unwrap();
    assert!(matches!(start(&h, "done", "s1", 1).await, Err(MonitorError::OrdersAlreadyPlaced)));

    let bare = seed_analysis(&h, "bare", &["s1"]).await;
    let mut no_triggers = strategy("s1");
    no_triggers.triggers.clear();
    let mut active: stock_analyses::ActiveModel = bare.into();
    active.strategies = ActiveValue::Set(Strategies(vec![no_triggers]));
    active.update(h.db.as_ref()).await.unwrap();
    let err = start(&h, "bare", "s1", 1).await.unwrap_err();
    assert!(err.to_string().contains("no entry triggers"));

    assert!(h.state.registry.find_by_analysis("old").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_start_after_attach_window_is_refused() {
    let h = harness().await;
    seed_analysis(&h, "a1", &["s1"]).await;
    let sub = insert_subscription(
        h.db.as_ref(),
        "a1",
        "s1",
        &[1],
        SubscriptionStatus::ConditionsMet,
        Utc::now() + Duration::hours(2),
    )
    .await;
    let mut active: shared::entity::monitoring_subscriptions::ActiveModel = sub.into();
    active.conditions_met_at = ActiveValue::Set(Some(Utc::now() - Duration::hours(1)));
    active.update(h.db.as_ref()).await.unwrap();

    let err = start(&h, "a1", "s1", 2).await.unwrap_err();
    assert!(matches!(err, MonitorError::CannotStart(_)));
    assert_eq!(err.code(), "CANNOT_START");
}

#[tokio::test]
async fn test_late_joiner_sees_trigger_within_window() {
    let h = harness().await;
    seed_analysis(&h, "a1", &["s1"]).await;
    start(&h, "a1", "s1", 1).await.unwrap();
    h.evaluator.script("a1", "s1", FakeResponse::Satisfied(152.0));
    h.state.executor.process_analysis("a1").await.unwrap();

    let res = start(&h, "a1", "s1", 2).await.unwrap();
    assert!(res.already_triggered);
    assert_eq!(res.subscriber_count, 2);
}

#[tokio::test]
async fn test_stop_single_user_then_last_user() {
    let h = harness().await;
    seed_analysis(&h, "a1", &["s1"]).await;
    start(&h, "a1", "s1", 1).await.unwrap();
    start(&h, "a1", "s1", 2).await.unwrap();

    let res = h.state.monitoring.stop_monitoring("a1", Some("s1"), Some(1)).await.unwrap();
    assert_eq!(res.cancelled_count, 1);
    let sub = h.state.registry.find("a1", "s1").await.unwrap().unwrap();
    assert_eq!(sub.subscribers.user_ids(), vec![2]);
    assert!(h.evaluator.cleared().is_empty());

    // not subscribed: nothing to cancel
    let res = h.state.monitoring.stop_monitoring("a1", Some("s1"), Some(1)).await.unwrap();
    assert_eq!(res.cancelled_count, 0);

    h.state.monitoring.stop_monitoring("a1", Some("s1"), Some(2)).await.unwrap();
    assert!(h.state.registry.find("a1", "s1").await.unwrap().is_none());
    assert_eq!(h.evaluator.cleared(), vec![("a1".to_string(), "s1".to_string())]);

    let cancelled = h.state.audit.find_by_status(AuditStatus::Cancelled).await.unwrap();
    assert_eq!(cancelled.len(), 2);
}

#[tokio::test]
async fn test_stop_all_strategies_of_an_analysis() {
    let h = harness().await;
    seed_analysis(&h, "a1", &["s1", "s2"]).await;
    start(&h, "a1", "s1", 1).await.unwrap();
    start(&h, "a1", "s2", 1).await.unwrap();
    start(&h, "a1", "s2", 2).await.unwrap();

    let res = h.state.monitoring.stop_monitoring("a1", None, None).await.unwrap();
    assert_eq!(res.cancelled_count, 2);
    assert!(h.state.registry.find_by_analysis("a1").await.unwrap().is_empty());
    assert_eq!(h.state.audit.find_by_status(AuditStatus::Cancelled).await.unwrap().len(), 3);

    let batches = h.state.planner.plan(&h.state.registry).await.unwrap();
    assert!(batches.is_empty());
}

#[tokio::test]
async fn test_setup_wide_stop_tells_every_subscriber() {
    let h = harness().await;
    seed_analysis(&h, "a1", &["s1", "s2"]).await;
    start(&h, "a1", "s1", 1).await.unwrap();
    start(&h, "a1", "s2", 1).await.unwrap();
    start(&h, "a1", "s2", 2).await.unwrap();

    h.state.monitoring.stop_monitoring("a1", None, None).await.unwrap();

    let notices = h.notifier.sent_of("monitoring_stopped");
    let mut recipients: Vec<i64> = notices.iter().map(|(u, _)| *u).collect();
    recipients.sort();
    assert_eq!(recipients, vec![1, 1, 2]);
    assert!(notices.iter().any(|(_, n)| n.message.contains("Breakout s2")));
}

#[tokio::test]
async fn test_leaving_a_setup_sends_no_stop_notice() {
    let h = harness().await;
    seed_analysis(&h, "a1", &["s1"]).await;
    start(&h, "a1", "s1", 1).await.unwrap();
    start(&h, "a1", "s1", 2).await.unwrap();

    h.state.monitoring.stop_monitoring("a1", Some("s1"), Some(1)).await.unwrap();
    assert!(h.notifier.sent_of("monitoring_stopped").is_empty());
}

#[tokio::test]
async fn test_status_reflects_lifecycle() {
    let h = harness().await;
    seed_analysis(&h, "a1", &["s1"]).await;

    let status = h.state.monitoring.get_monitoring_status("a1", Some("s1"), None).await.unwrap();
    assert_eq!(status.state, ClientState::Inactive);

    start(&h, "a1", "s1", 1).await.unwrap();
    let status = h.state.monitoring.get_monitoring_status("a1", Some("s1"), Some(1)).await.unwrap();
    assert_eq!(status.state, ClientState::Active);
    assert_eq!(status.subscriber_count, 1);

    // another user is not part of it
    let status = h.state.monitoring.get_monitoring_status("a1", Some("s1"), Some(7)).await.unwrap();
    assert_eq!(status.state, ClientState::Inactive);

    h.evaluator.script("a1", "s1", FakeResponse::Satisfied(152.3));
    h.state.executor.process_analysis("a1").await.unwrap();
    let status = h.state.monitoring.get_monitoring_status("a1", None, Some(1)).await.unwrap();
    assert_eq!(status.state, ClientState::Finished);
    assert_eq!(status.trigger_price, Some(152.3));
    assert!(status.conditions_met_at.is_some());
}

#[tokio::test]
async fn test_status_expired_and_error_states() {
    let h = harness().await;
    insert_subscription(h.db.as_ref(), "lapsed", "s1", &[1], SubscriptionStatus::Active, Utc::now() - Duration::minutes(1)).await;
    let status = h.state.monitoring.get_monitoring_status("lapsed", Some("s1"), None).await.unwrap();
    assert_eq!(status.state, ClientState::Expired);

    insert_subscription(h.db.as_ref(), "ghost", "s1", &[1], SubscriptionStatus::Active, Utc::now() + Duration::hours(1)).await;
    let status = h.state.monitoring.get_monitoring_status("ghost", None, None).await.unwrap();
    assert_eq!(status.state, ClientState::Error);
}

#[tokio::test]
async fn test_status_prefers_live_strategy_across_analysis() {
    let h = harness().await;
    seed_analysis(&h, "a1", &["s1", "s2"]).await;
    insert_subscription(h.db.as_ref(), "a1", "s1", &[1], SubscriptionStatus::Invalidated, Utc::now() + Duration::hours(1)).await;
    start(&h, "a1", "s2", 1).await.unwrap();

    let status = h.state.monitoring.get_monitoring_status("a1", None, None).await.unwrap();
    assert_eq!(status.state, ClientState::Active);
    assert_eq!(status.strategy_id.as_deref(), Some("s2"));
}

#[tokio::test]
async fn test_pause_and_resume() {
    let h = harness().await;
    seed_analysis(&h, "a1", &["s1"]).await;
    start(&h, "a1", "s1", 1).await.unwrap();
    start(&h, "a1", "s1", 2).await.unwrap();

    let status = h.state.monitoring.pause_monitoring("a1", "s1", Some(1)).await.unwrap();
    assert_eq!(status.state, ClientState::Paused);
    let other = h.state.monitoring.get_monitoring_status("a1", Some("s1"), Some(2)).await.unwrap();
    assert_eq!(other.state, ClientState::Active);

    let status = h.state.monitoring.resume_monitoring("a1", "s1", Some(1)).await.unwrap();
    assert_eq!(status.state, ClientState::Active);

    assert!(matches!(
        h.state.monitoring.pause_monitoring("a1", "s1", Some(99)).await,
        Err(MonitorError::NotMonitoring)
    ));
    assert!(matches!(
        h.state.monitoring.pause_monitoring("a1", "s9", None).await,
        Err(MonitorError::NotMonitoring)
    ));
}

#[tokio::test]
async fn test_resume_refused_once_analysis_expired() {
    let h = harness().await;
    let analysis = seed_analysis(&h, "a1", &["s1"]).await;
    start(&h, "a1", "s1", 1).await.unwrap();
    h.state.monitoring.pause_monitoring("a1", "s1", Some(1)).await.unwrap();

    let mut active: stock_analyses::ActiveModel = analysis.into();
    active.valid_until = ActiveValue::Set(Utc::now() - Duration::minutes(1));
    active.update(h.db.as_ref()).await.unwrap();

    assert!(matches!(
        h.state.monitoring.resume_monitoring("a1", "s1", Some(1)).await,
        Err(MonitorError::AnalysisExpired)
    ));
}
