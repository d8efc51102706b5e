mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use common::{harness, seed_analysis, setup_db, FakeResponse};
use monitor::scheduler::{JobHandler, JobRun, JobScheduler, SchedulerConfig, BATCH_MONITORING_JOB};
use monitor::services::StartOptions;
use sea_orm::{ActiveModelTrait, ActiveValue};
use serde_json::json;
use shared::entity::monitoring_jobs;
use shared::SubscriptionStatus;

#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    Fail,
    Panic,
}

struct CountingJob {
    runs: AtomicUsize,
    behaviour: Behaviour,
}

impl CountingJob {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicUsize::new(0),
            behaviour,
        })
    }
}

#[async_trait]
impl JobHandler for CountingJob {
    async fn run(&self, job: JobRun) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::Fail => Err(anyhow!("upstream timeout for {}", job.key)),
            Behaviour::Panic => panic!("handler bug in {}", job.key),
        }
    }
}

async fn scheduler() -> Arc<JobScheduler> {
    JobScheduler::new(setup_db().await, SchedulerConfig::default())
}

async fn only_definition(scheduler: &JobScheduler, name: &str) -> monitoring_jobs::Model {
    let mut defs = scheduler.definitions(name).await.unwrap();
    assert_eq!(defs.len(), 1);
    defs.remove(0)
}

#[tokio::test]
async fn test_due_job_runs_once_and_is_rescheduled() {
    let scheduler = scheduler().await;
    let job = CountingJob::new(Behaviour::Succeed);
    scheduler.register("ping", job.clone(), 1).await;
    let before = Utc::now();
    scheduler
        .every("ping", "k1", StdDuration::from_secs(60), json!({"n": 1}), before - Duration::seconds(1))
        .await
        .unwrap();

    assert_eq!(scheduler.run_once().await.unwrap(), 1);
    scheduler.wait_idle().await;
    assert_eq!(job.runs.load(Ordering::SeqCst), 1);

    let def = only_definition(&scheduler, "ping").await;
    assert!(def.next_run_at >= before + Duration::seconds(60));
    assert!(def.locked_by.is_none());
    assert!(def.last_finished_at.is_some());
    assert_eq!(def.fail_count, 0);

    // not due again yet
    assert_eq!(scheduler.run_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_failure_is_recorded_and_job_stays_scheduled() {
    let scheduler = scheduler().await;
    let job = CountingJob::new(Behaviour::Fail);
    scheduler.register("flaky", job.clone(), 1).await;
    scheduler
        .every("flaky", "k1", StdDuration::from_secs(60), json!({}), Utc::now() - Duration::seconds(1))
        .await
        .unwrap();

    scheduler.run_once().await.unwrap();
    scheduler.wait_idle().await;

    let def = only_definition(&scheduler, "flaky").await;
    assert_eq!(def.fail_count, 1);
    assert!(def.last_error.unwrap().contains("upstream timeout for k1"));
    assert!(def.next_run_at > Utc::now());
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let scheduler = scheduler().await;
    let bad = CountingJob::new(Behaviour::Panic);
    let good = CountingJob::new(Behaviour::Succeed);
    scheduler.register("bad", bad.clone(), 1).await;
    scheduler.register("good", good.clone(), 1).await;
    let due = Utc::now() - Duration::seconds(1);
    scheduler.every("bad", "k", StdDuration::from_secs(60), json!({}), due).await.unwrap();
    scheduler.every("good", "k", StdDuration::from_secs(60), json!({}), due).await.unwrap();

    assert_eq!(scheduler.run_once().await.unwrap(), 2);
    scheduler.wait_idle().await;

    assert_eq!(good.runs.load(Ordering::SeqCst), 1);
    let def = only_definition(&scheduler, "bad").await;
    assert!(def.last_error.unwrap().contains("panicked"));
    assert!(def.locked_by.is_none());
}

#[tokio::test]
async fn test_unregistered_jobs_are_left_alone() {
    let scheduler = scheduler().await;
    scheduler
        .every("orphan", "k", StdDuration::from_secs(60), json!({}), Utc::now() - Duration::seconds(1))
        .await
        .unwrap();

    assert_eq!(scheduler.run_once().await.unwrap(), 0);
    let def = only_definition(&scheduler, "orphan").await;
    assert!(def.locked_by.is_none());
    assert!(def.last_run_at.is_none());
}

#[tokio::test]
async fn test_stale_lock_from_dead_process_is_taken_over() {
    let db = setup_db().await;
    let scheduler = JobScheduler::new(db.clone(), SchedulerConfig::default());
    let job = CountingJob::new(Behaviour::Succeed);
    scheduler.register("ping", job.clone(), 1).await;
    let def = scheduler
        .every("ping", "k", StdDuration::from_secs(60), json!({}), Utc::now() - Duration::seconds(1))
        .await
        .unwrap();

    let mut active: monitoring_jobs::ActiveModel = def.into();
    active.locked_at = ActiveValue::Set(Some(Utc::now() - Duration::minutes(1)));
    active.locked_by = ActiveValue::Set(Some("monitor-alive".to_string()));
    let def = active.update(db.as_ref()).await.unwrap();

    // a fresh lock is respected
    assert_eq!(scheduler.run_once().await.unwrap(), 0);

    let mut active: monitoring_jobs::ActiveModel = def.into();
    active.locked_at = ActiveValue::Set(Some(Utc::now() - Duration::hours(1)));
    active.locked_by = ActiveValue::Set(Some("monitor-dead".to_string()));
    active.update(db.as_ref()).await.unwrap();

    assert_eq!(scheduler.run_once().await.unwrap(), 1);
    scheduler.wait_idle().await;
    assert_eq!(job.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_every_replaces_existing_definition() {
    let scheduler = scheduler().await;
    let now = Utc::now();
    scheduler.every("ping", "k", StdDuration::from_secs(60), json!({"v": 1}), now).await.unwrap();
    scheduler.every("ping", "k", StdDuration::from_secs(120), json!({"v": 2}), now).await.unwrap();

    let def = only_definition(&scheduler, "ping").await;
    assert_eq!(def.payload, json!({"v": 2}));
    assert_eq!(def.schedule, shared::JobSchedule::Every { seconds: 120 });

    assert_eq!(scheduler.cancel("ping").await.unwrap(), 1);
    assert!(scheduler.definitions("ping").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_replan_installs_batch_jobs_that_check_subscriptions() {
    let h = harness().await;
    for id in ["a1", "a2"] {
        seed_analysis(&h, id, &["s1"]).await;
        h.state
            .monitoring
            .start_monitoring(id, "s1", 1, 900, StartOptions::default())
            .await
            .unwrap();
    }
    h.evaluator.script("a2", "s1", FakeResponse::Satisfied(152.0));

    let batches = h.state.replanner.replan().await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].batch_id, "batch_1");

    let defs = h.state.scheduler.definitions(BATCH_MONITORING_JOB).await.unwrap();
    assert_eq!(defs.len(), 1);
    assert_eq!(defs[0].job_key, "batch_1");
    let sub = h.state.registry.find("a1", "s1").await.unwrap().unwrap();
    assert_eq!(sub.job_ref.as_deref(), Some("batch_1"));

    assert_eq!(h.state.scheduler.run_once().await.unwrap(), 1);
    h.state.scheduler.wait_idle().await;

    assert_eq!(h.evaluator.calls.load(Ordering::SeqCst), 2);
    let triggered = h.state.registry.find("a2", "s1").await.unwrap().unwrap();
    assert_eq!(triggered.status, SubscriptionStatus::ConditionsMet);

    // a fast clean firing grows the next target
    assert_eq!(h.state.planner.config().await.target_batch_size, 60);

    // nothing live left for a2; replanning drops it
    let batches = h.state.replanner.replan().await.unwrap();
    assert_eq!(batches[0].analysis_ids, vec!["a1".to_string()]);
}

#[tokio::test]
async fn test_replan_keeps_schedule_of_surviving_batches() {
    let h = harness().await;
    seed_analysis(&h, "a1", &["s1"]).await;
    h.state
        .monitoring
        .start_monitoring("a1", "s1", 1, 900, StartOptions::default())
        .await
        .unwrap();

    h.state.replanner.replan().await.unwrap();
    assert_eq!(h.state.scheduler.run_once().await.unwrap(), 1);

    // replanning while the batch runs or right after it must not make it due again
    h.state.replanner.replan().await.unwrap();
    assert_eq!(h.state.scheduler.run_once().await.unwrap(), 0);
    h.state.scheduler.wait_idle().await;

    let def = only_definition(&h.state.scheduler, BATCH_MONITORING_JOB).await;
    assert!(def.next_run_at > Utc::now());
    h.state.replanner.replan().await.unwrap();
    let again = only_definition(&h.state.scheduler, BATCH_MONITORING_JOB).await;
    assert_eq!(again.next_run_at, def.next_run_at);
    assert_eq!(h.state.scheduler.run_once().await.unwrap(), 0);
    assert_eq!(h.evaluator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_every_keeps_next_run_and_lock_of_existing_definition() {
    let db = setup_db().await;
    let scheduler = JobScheduler::new(db.clone(), SchedulerConfig::default());
    let later = Utc::now() + Duration::minutes(10);
    let def = scheduler.every("ping", "k", StdDuration::from_secs(60), json!({}), later).await.unwrap();

    let mut active: monitoring_jobs::ActiveModel = def.into();
    active.locked_at = ActiveValue::Set(Some(Utc::now()));
    active.locked_by = ActiveValue::Set(Some("monitor-alive".to_string()));
    let def = active.update(db.as_ref()).await.unwrap();

    scheduler
        .every("ping", "k", StdDuration::from_secs(120), json!({"v": 2}), Utc::now() - Duration::seconds(1))
        .await
        .unwrap();
    let after = only_definition(&scheduler, "ping").await;
    assert_eq!(after.next_run_at, def.next_run_at);
    assert_eq!(after.locked_by.as_deref(), Some("monitor-alive"));
    assert_eq!(after.payload, json!({"v": 2}));
}

#[tokio::test]
async fn test_replan_with_no_subscriptions_removes_batch_jobs() {
    let h = harness().await;
    seed_analysis(&h, "a1", &["s1"]).await;
    h.state
        .monitoring
        .start_monitoring("a1", "s1", 1, 900, StartOptions::default())
        .await
        .unwrap();
    h.state.replanner.replan().await.unwrap();

    h.state.monitoring.stop_monitoring("a1", None, None).await.unwrap();
    let batches = h.state.replanner.replan().await.unwrap();
    assert!(batches.is_empty());
    assert!(h.state.scheduler.definitions(BATCH_MONITORING_JOB).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_start_installs_maintenance_jobs_and_replans_on_request() {
    let h = harness().await;
    h.state.start().await.unwrap();

    assert_eq!(h.state.scheduler.definitions("stale-lock-reclaim").await.unwrap().len(), 1);
    assert_eq!(h.state.scheduler.definitions("expiry-sweep").await.unwrap().len(), 1);

    seed_analysis(&h, "a1", &["s1"]).await;
    h.state
        .monitoring
        .start_monitoring("a1", "s1", 1, 900, StartOptions::default())
        .await
        .unwrap();

    // debounced replan picks up the new subscription
    let mut installed = false;
    for _ in 0..50 {
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        if !h.state.scheduler.definitions(BATCH_MONITORING_JOB).await.unwrap().is_empty() {
            installed = true;
            break;
        }
    }
    h.state.shutdown().await;
    assert!(installed);
}
