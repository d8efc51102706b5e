mod common;

use std::sync::atomic::Ordering;

use chrono::{Duration, Utc};
use common::{harness, insert_subscription, seed_analysis};
use sea_orm::{ActiveModelTrait, ActiveValue, ConnectionTrait};
use shared::entity::stock_analyses;
use shared::{AuditStatus, StopReason, SubscriptionStatus};

#[tokio::test]
async fn test_sweep_expires_overdue_subscriptions() {
    let h = harness().await;
    let now = Utc::now();
    insert_subscription(h.db.as_ref(), "a1", "s1", &[1, 2, 3], SubscriptionStatus::Active, now - Duration::minutes(1)).await;
    insert_subscription(h.db.as_ref(), "a2", "s1", &[4], SubscriptionStatus::Active, now + Duration::hours(2)).await;

    let report = h.state.maintenance.sweep_expired(now).await.unwrap();
    assert!(!report.skipped);
    assert_eq!(report.expired, 1);
    assert_eq!(report.audit_records, 3);

    let expired = h.state.registry.find("a1", "s1").await.unwrap().unwrap();
    assert_eq!(expired.status, SubscriptionStatus::Expired);
    assert_eq!(expired.stop_reason, Some(StopReason::Expired));
    let still_live = h.state.registry.find("a2", "s1").await.unwrap().unwrap();
    assert_eq!(still_live.status, SubscriptionStatus::Active);

    let audit = h.state.audit.find_by_status(AuditStatus::Expired).await.unwrap();
    let mut users: Vec<i64> = audit.iter().map(|a| a.user_id).collect();
    users.sort();
    assert_eq!(users, vec![1, 2, 3]);

    assert_eq!(h.notifier.sent_of("monitoring_stopped").len(), 3);
    assert_eq!(h.evaluator.cleared(), vec![("a1".to_string(), "s1".to_string())]);

    // nothing left to expire on a second pass
    let again = h.state.maintenance.sweep_expired(now).await.unwrap();
    assert_eq!(again.expired, 0);
}

#[tokio::test]
async fn test_sweep_carries_on_when_audit_writes_fail() {
    let h = harness().await;
    let now = Utc::now();
    insert_subscription(h.db.as_ref(), "a1", "s1", &[1, 2], SubscriptionStatus::Active, now - Duration::minutes(1)).await;
    insert_subscription(h.db.as_ref(), "a2", "s1", &[3], SubscriptionStatus::Active, now - Duration::minutes(2)).await;
    h.db.execute_unprepared("DROP TABLE monitoring_audit_logs").await.unwrap();

    let report = h.state.maintenance.sweep_expired(now).await.unwrap();
    assert_eq!(report.expired, 2);
    assert_eq!(report.audit_records, 0);
    assert_eq!(report.failures, 2);

    // every expired row still got its notices and session cleanup
    let mut notified: Vec<i64> = h.notifier.sent_of("monitoring_stopped").iter().map(|(u, _)| *u).collect();
    notified.sort();
    assert_eq!(notified, vec![1, 2, 3]);
    assert_eq!(h.evaluator.cleared().len(), 2);
    for analysis in ["a1", "a2"] {
        let sub = h.state.registry.find(analysis, "s1").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Expired);
    }
}

#[tokio::test]
async fn test_sweep_skips_non_trading_days() {
    let h = harness().await;
    let now = Utc::now();
    insert_subscription(h.db.as_ref(), "a1", "s1", &[1], SubscriptionStatus::Active, now - Duration::minutes(1)).await;
    h.calendar.trading_day.store(false, Ordering::SeqCst);

    let report = h.state.maintenance.sweep_expired(now).await.unwrap();
    assert!(report.skipped);
    assert_eq!(report.expired, 0);
    let sub = h.state.registry.find("a1", "s1").await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_sweep_purges_long_retired_rows() {
    let h = harness().await;
    let now = Utc::now();
    insert_subscription(h.db.as_ref(), "old", "s1", &[1], SubscriptionStatus::Cancelled, now - Duration::days(10)).await;

    let report = h.state.maintenance.sweep_expired(now).await.unwrap();
    assert_eq!(report.purged, 1);
    assert!(h.state.registry.find("old", "s1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_reclaims_only_stale_order_flags() {
    let h = harness().await;
    let now = Utc::now();
    for (id, started) in [("stale", now - Duration::minutes(20)), ("fresh", now - Duration::minutes(1))] {
        let analysis = seed_analysis(&h, id, &["s1"]).await;
        let mut active: stock_analyses::ActiveModel = analysis.into();
        active.order_placement_in_progress = ActiveValue::Set(true);
        active.order_placement_started_at = ActiveValue::Set(Some(started));
        active.update(h.db.as_ref()).await.unwrap();
    }

    assert_eq!(h.state.maintenance.reclaim_stale_order_locks(now).await.unwrap(), 1);

    let stale = h.state.analyses.find_by_id("stale").await.unwrap().unwrap();
    assert!(!stale.order_placement_in_progress);
    assert!(stale.order_placement_started_at.is_none());
    let fresh = h.state.analyses.find_by_id("fresh").await.unwrap().unwrap();
    assert!(fresh.order_placement_in_progress);
}
