use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::planner::{Batch, BatchPlanner};
use super::registry::SubscriptionRegistry;
use crate::scheduler::{JobScheduler, BATCH_MONITORING_JOB};

/// Keeps the installed batch jobs in step with the registry.
pub struct Replanner {
    registry: Arc<SubscriptionRegistry>,
    planner: Arc<BatchPlanner>,
    scheduler: Arc<JobScheduler>,
    batch_interval: Duration,
    debounce: Duration,
    requests: mpsc::Sender<()>,
    pending: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Replanner {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        planner: Arc<BatchPlanner>,
        scheduler: Arc<JobScheduler>,
        batch_interval: Duration,
        debounce: Duration,
    ) -> Arc<Self> {
        let (requests, rx) = mpsc::channel(1);
        Arc::new(Self {
            registry,
            planner,
            scheduler,
            batch_interval,
            debounce,
            requests,
            pending: Mutex::new(Some(rx)),
        })
    }

    /// Installs a fresh plan. Batch keys that survive keep their next run and lock, so a
    /// replan never fires a batch early or while it is still running. Keys no longer in
    /// the plan are dropped.
    pub async fn replan(&self) -> Result<Vec<Batch>> {
        let batches = self.planner.plan(&self.registry).await?;

        let planned: HashSet<&str> = batches.iter().map(|b| b.batch_id.as_str()).collect();
        let mut removed = 0;
        for def in self.scheduler.definitions(BATCH_MONITORING_JOB).await? {
            if !planned.contains(def.job_key.as_str()) {
                removed += self.scheduler.cancel_key(BATCH_MONITORING_JOB, &def.job_key).await?;
            }
        }

        let first_run = Utc::now();
        for batch in &batches {
            let payload = serde_json::to_value(batch)?;
            self.scheduler
                .every(BATCH_MONITORING_JOB, &batch.batch_id, self.batch_interval, payload, first_run)
                .await?;
            self.registry
                .assign_job_refs(batch.analysis_ids.clone(), &batch.batch_id)
                .await?;
        }

        info!("🗓 Replanned: {} batch job(s) installed, {} removed", batches.len(), removed);
        Ok(batches)
    }

    /// Asks for a replan after the debounce delay. Requests made while one is pending coalesce.
    pub fn request_replan(&self) {
        // a full channel already holds a pending request
        let _ = self.requests.try_send(());
    }

    /// Starts the debounce loop. Only the first call has any effect.
    pub async fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.pending.lock().await.take()?;
        let this = self.clone();
        Some(tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(this.debounce).await;
                while rx.try_recv().is_ok() {}
                if let Err(e) = this.replan().await {
                    error!("❌ Replan failed: {:#}", e);
                }
            }
        }))
    }
}
