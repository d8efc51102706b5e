pub mod engine;
pub mod jobs;

pub use engine::{next_run_after, JobHandler, JobRun, JobScheduler, SchedulerConfig};
pub use jobs::{BATCH_MONITORING_JOB, EXPIRY_SWEEP_JOB, STALE_LOCK_RECLAIM_JOB};
