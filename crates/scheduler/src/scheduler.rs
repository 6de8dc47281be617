//! Cron-driven producer: wires schedule entries into `tokio-cron-scheduler`.

use std::sync::Arc;

use tokio_cron_scheduler::{Job as CronJob, JobScheduler, JobSchedulerError};
use tracing::{error, info};

use pagesmith_queue::Queue;

use crate::schedule::ScheduleEntry;

/// Scheduler error.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Invalid cron expression or scheduler runtime failure.
    #[error("scheduler error: {0}")]
    Schedule(#[from] JobSchedulerError),
}

/// A pure producer: holds no job state, performs no claiming.
///
/// Each entry becomes an independent cron trigger that calls `enqueue`. An
/// enqueue failure is logged and fatal for that firing only — it never
/// takes down the scheduler process.
pub struct Scheduler {
    queue: Arc<Queue>,
    entries: Vec<ScheduleEntry>,
}

impl Scheduler {
    pub fn new(queue: Arc<Queue>) -> Self {
        Self {
            queue,
            entries: Vec::new(),
        }
    }

    pub fn with_entries(queue: Arc<Queue>, entries: Vec<ScheduleEntry>) -> Self {
        Self { queue, entries }
    }

    pub fn add_entry(mut self, entry: ScheduleEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Register every entry and start firing.
    ///
    /// Fails fast on an invalid cron expression, before anything runs.
    pub async fn start(self) -> Result<SchedulerHandle, SchedulerError> {
        let sched = JobScheduler::new().await?;

        for entry in self.entries {
            let entry = Arc::new(entry);
            let queue = self.queue.clone();
            let cron = entry.cron.clone();

            let cron_job = CronJob::new_async(cron.as_str(), move |_id, _sched| {
                let entry = entry.clone();
                let queue = queue.clone();
                Box::pin(async move {
                    match entry.fire(&queue).await {
                        Ok(job_id) => {
                            info!(job_name = %entry.job_name, job_id = %job_id, "scheduled job enqueued");
                        }
                        Err(e) => {
                            // Fatal for this firing only; the trigger stays
                            // registered and fires again next time.
                            error!(job_name = %entry.job_name, error = %e, "scheduled enqueue failed");
                        }
                    }
                })
            })?;
            sched.add(cron_job).await?;
        }

        sched.start().await?;
        Ok(SchedulerHandle { inner: sched })
    }
}

/// Handle to a started scheduler.
pub struct SchedulerHandle {
    inner: JobScheduler,
}

impl SchedulerHandle {
    /// Stop firing and release the scheduler's background tasks.
    pub async fn shutdown(mut self) -> Result<(), SchedulerError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
