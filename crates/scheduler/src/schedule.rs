//! Recurring triggers as data: cron expression, job name, payload factory.

use std::sync::Arc;

use serde_json::{json, Value};

use pagesmith_core::JobId;
use pagesmith_queue::{EnqueueOptions, Queue, QueueError};

/// Produces the payload for each firing. Factories run at trigger time, so
/// payloads can carry the firing date or other trigger-local data.
pub type PayloadFactory = Arc<dyn Fn() -> Value + Send + Sync>;

/// One recurring trigger.
///
/// Cron expressions are six-field (seconds first), evaluated in UTC.
#[derive(Clone)]
pub struct ScheduleEntry {
    pub cron: String,
    pub job_name: String,
    payload: PayloadFactory,
    options: EnqueueOptions,
}

impl ScheduleEntry {
    pub fn new(cron: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            cron: cron.into(),
            job_name: job_name.into(),
            payload: Arc::new(|| json!({})),
            options: EnqueueOptions::default(),
        }
    }

    pub fn with_payload(mut self, payload: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.payload = Arc::new(payload);
        self
    }

    pub fn with_options(mut self, options: EnqueueOptions) -> Self {
        self.options = options;
        self
    }

    /// Enqueue one firing of this trigger.
    pub async fn fire(&self, queue: &Queue) -> Result<JobId, QueueError> {
        queue
            .enqueue(&self.job_name, &(self.payload)(), self.options.clone())
            .await
    }
}

impl core::fmt::Debug for ScheduleEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScheduleEntry")
            .field("cron", &self.cron)
            .field("job_name", &self.job_name)
            .finish()
    }
}

/// The stock recurring set the CMS runs with.
///
/// Timings are spread across the night so the heavier jobs never share a
/// slot; the queue serializes execution regardless.
pub fn default_schedules() -> Vec<ScheduleEntry> {
    vec![
        ScheduleEntry::new("0 15 * * * *", "cache.cleanup"),
        ScheduleEntry::new("0 5 1 * * *", "analytics.aggregate"),
        ScheduleEntry::new("0 30 2 * * *", "backup.run")
            .with_payload(|| json!({"kind": "full"})),
        ScheduleEntry::new("0 0 3 * * *", "sitemap.generate"),
        ScheduleEntry::new("0 45 4 * * *", "logs.cleanup")
            .with_payload(|| json!({"retain_days": 30})),
    ]
}
