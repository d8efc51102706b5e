use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use super::engine::{JobHandler, JobRun};
use crate::services::batch_executor::BatchExecutor;
use crate::services::maintenance::MaintenanceService;
use crate::services::planner::{Batch, BatchPlanner};

pub const BATCH_MONITORING_JOB: &str = "batch-monitoring";
pub const STALE_LOCK_RECLAIM_JOB: &str = "stale-lock-reclaim";
pub const EXPIRY_SWEEP_JOB: &str = "expiry-sweep";

/// Executes one planned batch and feeds its timings back to the planner.
pub struct BatchMonitoringJob {
    pub executor: Arc<BatchExecutor>,
    pub planner: Arc<BatchPlanner>,
}

#[async_trait]
impl JobHandler for BatchMonitoringJob {
    async fn run(&self, job: JobRun) -> Result<()> {
        let batch: Batch = serde_json::from_value(job.payload)
            .with_context(|| format!("Job {} carries an unreadable batch", job.key))?;
        let metrics = self.executor.execute_batch(&batch).await;
        if metrics.error_count > 0 {
            warn!(
                "⚠️ {} finished with {} failed analyses: {}",
                batch.batch_id,
                metrics.error_count,
                metrics.errors.join(" | ")
            );
        }
        self.planner.record_metrics(&metrics).await;
        Ok(())
    }
}

pub struct StaleLockReclaimJob {
    pub maintenance: Arc<MaintenanceService>,
}

#[async_trait]
impl JobHandler for StaleLockReclaimJob {
    async fn run(&self, _job: JobRun) -> Result<()> {
        self.maintenance.reclaim_stale_order_locks(Utc::now()).await?;
        Ok(())
    }
}

pub struct ExpirySweepJob {
    pub maintenance: Arc<MaintenanceService>,
}

#[async_trait]
impl JobHandler for ExpirySweepJob {
    async fn run(&self, _job: JobRun) -> Result<()> {
        self.maintenance.sweep_expired(Utc::now()).await?;
        Ok(())
    }
}
