use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{NaiveTime, Utc};
use sea_orm::DatabaseConnection;
use serde_json::json;
use shared::Config;
use tokio::task::JoinHandle;
use tokio::sync::Mutex;

use crate::repositories::{AnalysisRepository, AuditRepository};
use crate::scheduler::jobs::{BatchMonitoringJob, ExpirySweepJob, StaleLockReclaimJob};
use crate::scheduler::{JobScheduler, SchedulerConfig, BATCH_MONITORING_JOB, EXPIRY_SWEEP_JOB, STALE_LOCK_RECLAIM_JOB};
use crate::services::{
    BatchExecutor, BatchPlanner, ExecutorDeps, MaintenanceService, MarketCalendar, MonitoringService,
    NotificationDispatcher, OrderExecutor, PlannerConfig, Replanner, SubscriptionRegistry, TriggerEvaluator,
};

pub type HandlerResult = Result<(), anyhow::Error>;

/// External services the monitor talks to.
pub struct Collaborators {
    pub calendar: Arc<dyn MarketCalendar>,
    pub evaluator: Arc<dyn TriggerEvaluator>,
    pub notifier: Arc<dyn NotificationDispatcher>,
    pub orders: Arc<dyn OrderExecutor>,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub bot_name: String,
    pub planner: PlannerConfig,
    pub scheduler: SchedulerConfig,
    pub batch_interval: Duration,
    pub batch_job_concurrency: usize,
    pub replan_debounce: Duration,
    pub stale_lock_sweep: Duration,
    pub expiry_sweep_time: NaiveTime,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bot_name: config.bot_name.clone(),
            planner: PlannerConfig {
                target_batch_size: config.batch_target_size,
                min_batch_size: config.batch_min_size,
                ..PlannerConfig::default()
            },
            scheduler: SchedulerConfig {
                poll_interval: Duration::from_secs(config.scheduler_poll_secs.max(1)),
                max_concurrency: config.scheduler_concurrency,
                lock_lifetime: chrono::Duration::seconds(config.job_lock_lifetime_secs),
                timezone: config.market_timezone,
            },
            batch_interval: Duration::from_secs(config.batch_interval_secs),
            batch_job_concurrency: config.batch_job_concurrency,
            replan_debounce: Duration::from_secs(config.replan_debounce_secs),
            stale_lock_sweep: Duration::from_secs(config.stale_lock_sweep_secs),
            expiry_sweep_time: config.expiry_sweep_time,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            bot_name: "SetupWatch".to_string(),
            planner: PlannerConfig::default(),
            scheduler: SchedulerConfig::default(),
            batch_interval: Duration::from_secs(900),
            batch_job_concurrency: 5,
            replan_debounce: Duration::from_secs(5),
            stale_lock_sweep: Duration::from_secs(300),
            expiry_sweep_time: NaiveTime::from_hms_opt(15, 35, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

pub struct AppState {
    pub bot_name: String,
    pub db: Arc<DatabaseConnection>,
    pub settings: MonitorSettings,
    pub registry: Arc<SubscriptionRegistry>,
    pub analyses: Arc<AnalysisRepository>,
    pub audit: Arc<AuditRepository>,
    pub planner: Arc<BatchPlanner>,
    pub scheduler: Arc<JobScheduler>,
    pub replanner: Arc<Replanner>,
    pub executor: Arc<BatchExecutor>,
    pub maintenance: Arc<MaintenanceService>,
    pub monitoring: Arc<MonitoringService>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    /// Wires every component and registers the job handlers. Nothing runs until `start`.
    pub async fn assemble(
        db: Arc<DatabaseConnection>,
        settings: MonitorSettings,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let registry = Arc::new(SubscriptionRegistry::new(db.clone()));
        let analyses = Arc::new(AnalysisRepository::new(db.clone()));
        let audit = Arc::new(AuditRepository::new(db.clone()));
        let planner = Arc::new(BatchPlanner::new(settings.planner.clone()));
        let scheduler = JobScheduler::new(db.clone(), settings.scheduler.clone());
        let replanner = Replanner::new(
            registry.clone(),
            planner.clone(),
            scheduler.clone(),
            settings.batch_interval,
            settings.replan_debounce,
        );

        let executor = Arc::new(BatchExecutor::new(ExecutorDeps {
            registry: registry.clone(),
            analyses: analyses.clone(),
            audit: audit.clone(),
            calendar: collaborators.calendar.clone(),
            evaluator: collaborators.evaluator.clone(),
            notifier: collaborators.notifier.clone(),
            orders: collaborators.orders.clone(),
        }));
        let maintenance = Arc::new(MaintenanceService::new(
            registry.clone(),
            analyses.clone(),
            audit.clone(),
            collaborators.calendar.clone(),
            collaborators.evaluator.clone(),
            collaborators.notifier.clone(),
        ));
        let monitoring = Arc::new(MonitoringService::new(
            registry.clone(),
            analyses.clone(),
            audit.clone(),
            collaborators.calendar.clone(),
            collaborators.evaluator.clone(),
            collaborators.notifier.clone(),
            replanner.clone(),
        ));

        scheduler
            .register(
                BATCH_MONITORING_JOB,
                Arc::new(BatchMonitoringJob {
                    executor: executor.clone(),
                    planner: planner.clone(),
                }),
                settings.batch_job_concurrency,
            )
            .await;
        scheduler
            .register(
                STALE_LOCK_RECLAIM_JOB,
                Arc::new(StaleLockReclaimJob {
                    maintenance: maintenance.clone(),
                }),
                1,
            )
            .await;
        scheduler
            .register(
                EXPIRY_SWEEP_JOB,
                Arc::new(ExpirySweepJob {
                    maintenance: maintenance.clone(),
                }),
                1,
            )
            .await;

        Arc::new(AppState {
            bot_name: settings.bot_name.clone(),
            db,
            settings,
            registry,
            analyses,
            audit,
            planner,
            scheduler,
            replanner,
            executor,
            maintenance,
            monitoring,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Installs the maintenance jobs, replans from the registry and starts polling.
    pub async fn start(&self) -> Result<()> {
        let first_sweep = Utc::now() + chrono::Duration::from_std(self.settings.stale_lock_sweep)?;
        self.scheduler
            .every(STALE_LOCK_RECLAIM_JOB, "default", self.settings.stale_lock_sweep, json!({}), first_sweep)
            .await?;
        self.scheduler
            .daily_at(EXPIRY_SWEEP_JOB, "default", self.settings.expiry_sweep_time, json!({}))
            .await?;

        // job rows may be from a previous process; the registry is the source of truth
        self.replanner.replan().await?;

        let mut background = self.background.lock().await;
        background.push(self.scheduler.start());
        if let Some(debouncer) = self.replanner.start().await {
            background.push(debouncer);
        }
        tracing::info!("✅ Monitoring engine started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        tracing::info!("Shutting down monitoring engine...");
        self.scheduler.shutdown(Duration::from_secs(30)).await;
        for handle in self.background.lock().await.drain(..) {
            handle.abort();
        }
        tracing::info!("✅ Monitoring engine stopped");
    }
}
