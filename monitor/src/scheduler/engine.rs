use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use sea_orm::DatabaseConnection;
use serde_json::Value;
use shared::entity::monitoring_jobs;
use shared::JobSchedule;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::repositories::JobRepository;

/// One firing of a persisted job definition.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub id: i64,
    pub name: String,
    pub key: String,
    pub payload: Value,
    pub scheduled_for: DateTime<Utc>,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: JobRun) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: StdDuration,
    /// Cap on concurrently running jobs across all definitions.
    pub max_concurrency: usize,
    /// A lock older than this belongs to a dead process.
    pub lock_lifetime: Duration,
    pub timezone: Tz,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: StdDuration::from_secs(5),
            max_concurrency: 20,
            lock_lifetime: Duration::minutes(10),
            timezone: chrono_tz::Asia::Kolkata,
        }
    }
}

struct Registration {
    handler: Arc<dyn JobHandler>,
    permits: Arc<Semaphore>,
}

/// Persistent recurring-job runner.
///
/// Definitions live in the `monitoring_jobs` table so they survive restarts. Every poll claims
/// due definitions with a conditional lock, so several processes can share one table.
pub struct JobScheduler {
    jobs: JobRepository,
    config: SchedulerConfig,
    instance_id: String,
    handlers: RwLock<HashMap<String, Registration>>,
    global: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl JobScheduler {
    pub fn new(db: Arc<DatabaseConnection>, config: SchedulerConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            jobs: JobRepository::new(db),
            global: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
            instance_id: format!("monitor-{}", uuid::Uuid::new_v4()),
            handlers: RwLock::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn timezone(&self) -> Tz {
        self.config.timezone
    }

    /// Binds a handler to a job name with its own concurrency cap.
    pub async fn register(&self, name: &str, handler: Arc<dyn JobHandler>, concurrency: usize) {
        let registration = Registration {
            handler,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        };
        self.handlers.write().await.insert(name.to_string(), registration);
        debug!("Registered job handler '{}' (concurrency {})", name, concurrency);
    }

    /// Installs a fixed-cadence definition first due at `first_run`. An existing definition
    /// takes the new payload and interval but keeps its next run and any lock held on it.
    pub async fn every(
        &self,
        name: &str,
        key: &str,
        interval: StdDuration,
        payload: Value,
        first_run: DateTime<Utc>,
    ) -> Result<monitoring_jobs::Model> {
        let schedule = JobSchedule::Every {
            seconds: interval.as_secs().max(1),
        };
        self.jobs.upsert(name, key, payload, schedule, first_run, false).await
    }

    /// Installs or replaces a once-a-day definition at `at` in the scheduler's timezone.
    pub async fn daily_at(&self, name: &str, key: &str, at: NaiveTime, payload: Value) -> Result<monitoring_jobs::Model> {
        use chrono::Timelike;
        let schedule = JobSchedule::DailyAt {
            hour: at.hour(),
            minute: at.minute(),
        };
        let next = next_run_after(&schedule, Utc::now(), self.config.timezone);
        self.jobs.upsert(name, key, payload, schedule, next, true).await
    }

    /// Drops every definition with this name.
    pub async fn cancel(&self, name: &str) -> Result<u64> {
        self.jobs.delete_by_name(name).await
    }

    pub async fn cancel_key(&self, name: &str, key: &str) -> Result<u64> {
        self.jobs.delete(name, key).await
    }

    pub async fn definitions(&self, name: &str) -> Result<Vec<monitoring_jobs::Model>> {
        self.jobs.list_by_name(name).await
    }

    pub async fn release_stale_locks(&self) -> Result<u64> {
        let released = self.jobs.release_stale_locks(Utc::now() - self.config.lock_lifetime).await?;
        if released > 0 {
            warn!("🔓 Released {} stale job lock(s)", released);
        }
        Ok(released)
    }

    /// Starts the poll loop. Stops when `shutdown` is called.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = this.release_stale_locks().await {
                error!("❌ Failed to release stale job locks: {:#}", e);
            }
            info!(
                "⏱ Scheduler {} polling every {:?} (max {} concurrent jobs)",
                this.instance_id, this.config.poll_interval, this.config.max_concurrency
            );
            let mut ticker = tokio::time::interval(this.config.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.run_once().await {
                            error!("❌ Scheduler poll failed: {:#}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Scheduler {} poll loop stopped", this.instance_id);
        })
    }

    /// Claims and dispatches every due definition that fits under the concurrency caps.
    /// Returns how many were dispatched.
    pub async fn run_once(self: &Arc<Self>) -> Result<usize> {
        let now = Utc::now();
        let stale_before = now - self.config.lock_lifetime;
        let due = self
            .jobs
            .find_due(now, stale_before, (self.config.max_concurrency * 2) as u64)
            .await?;

        let mut dispatched = 0;
        for job in due {
            let (handler, definition_permits) = {
                let handlers = self.handlers.read().await;
                match handlers.get(&job.name) {
                    Some(r) => (r.handler.clone(), r.permits.clone()),
                    None => {
                        debug!("No handler for job '{}', leaving it for another process", job.name);
                        continue;
                    }
                }
            };

            let Ok(global_permit) = self.global.clone().try_acquire_owned() else {
                break;
            };
            let Ok(definition_permit) = definition_permits.try_acquire_owned() else {
                continue;
            };
            if !self.jobs.try_lock(job.id, &self.instance_id, now, stale_before).await? {
                continue;
            }

            dispatched += 1;
            let this = self.clone();
            tokio::spawn(async move {
                let _permits = (global_permit, definition_permit);
                this.execute(job, handler).await;
            });
        }
        Ok(dispatched)
    }

    async fn execute(&self, job: monitoring_jobs::Model, handler: Arc<dyn JobHandler>) {
        let run = JobRun {
            id: job.id,
            name: job.name.clone(),
            key: job.job_key.clone(),
            payload: job.payload.clone(),
            scheduled_for: job.next_run_at,
        };
        let started = std::time::Instant::now();

        // a panicking handler must not take the scheduler down with it
        let outcome = tokio::spawn(async move { handler.run(run).await }).await;
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(join_err) => Some(format!("job panicked: {}", join_err)),
        };

        let finished = Utc::now();
        let next = next_run_after(&job.schedule, finished, self.config.timezone);
        match &error {
            None => debug!(
                "Job {}/{} finished in {}ms, next run {}",
                job.name,
                job.job_key,
                started.elapsed().as_millis(),
                next
            ),
            Some(e) => error!("❌ Job {}/{} failed: {}", job.name, job.job_key, e),
        }
        if let Err(e) = self.jobs.complete(job.id, next, finished, error).await {
            error!("❌ Failed to record completion of job {}/{}: {:#}", job.name, job.job_key, e);
        }
    }

    /// Waits until no job dispatched by this process is running.
    pub async fn wait_idle(&self) {
        let permits = self.config.max_concurrency.max(1) as u32;
        if let Ok(all) = self.global.acquire_many(permits).await {
            drop(all);
        }
    }

    /// Stops polling, lets running jobs finish (up to `grace`) and frees our locks.
    pub async fn shutdown(&self, grace: StdDuration) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(grace, self.wait_idle()).await.is_err() {
            warn!("⚠️ Jobs still running after {:?}, releasing their locks", grace);
        }
        match self.jobs.release_locks_of(&self.instance_id).await {
            Ok(n) if n > 0 => info!("🔓 Released {} job lock(s) on shutdown", n),
            Ok(_) => {}
            Err(e) => error!("❌ Failed to release job locks on shutdown: {:#}", e),
        }
    }
}

/// First firing strictly after `after`.
pub fn next_run_after(schedule: &JobSchedule, after: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    match *schedule {
        JobSchedule::Every { seconds } => after + Duration::seconds(seconds as i64),
        JobSchedule::DailyAt { hour, minute } => {
            let Some(at) = NaiveTime::from_hms_opt(hour, minute, 0) else {
                return after + Duration::days(1);
            };
            let local_date = after.with_timezone(&tz).date_naive();
            (0..=2)
                .filter_map(|offset| {
                    let date = local_date + Duration::days(offset);
                    tz.from_local_datetime(&date.and_time(at)).earliest()
                })
                .map(|local| local.with_timezone(&Utc))
                .find(|candidate| *candidate > after)
                .unwrap_or(after + Duration::days(1))
        }
    }
}
