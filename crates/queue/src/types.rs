//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pagesmith_core::{DomainError, FailedJobId, JobId, WorkerId};

/// Logical lane a job is routed through when none is given.
pub const DEFAULT_QUEUE: &str = "default";

/// Default ceiling on claim attempts before a failure is terminal.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Job execution status.
///
/// There is no `Failed` status: a terminally failed job leaves this table
/// entirely and becomes a [`FailedJob`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed (or requeued for retry).
    Queued,
    /// Claimed by a worker holding the lease.
    Processing,
    /// Finished successfully; retained for audit.
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            other => Err(DomainError::validation(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// A unit of deferred work.
///
/// The payload is an opaque serialized string: the queue stores and returns
/// it verbatim, and only the handler registered for `name` interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Handler routing key (e.g. `sitemap.generate`).
    pub name: String,
    pub payload: String,
    pub queue: String,
    /// Higher claims first among jobs whose `run_at` has passed.
    pub priority: i32,
    pub status: JobStatus,
    /// Not claimable before this instant; pushed forward on retry.
    pub run_at: DateTime<Utc>,
    /// Claim attempts so far, incremented atomically on each claim.
    pub attempts: i32,
    pub max_attempts: i32,
    /// Claim lease. `None` when unclaimed; a lease older than the configured
    /// lease duration is expired and the job may be reclaimed even though
    /// `locked_by` is still set.
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<WorkerId>,
    /// Most recent failure, retained across successful retries.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a new job row; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub payload: String,
    pub queue: String,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub max_attempts: i32,
}

/// Options accepted by `enqueue`.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub queue: String,
    pub priority: i32,
    /// Delayed execution; `None` means claimable immediately.
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: i32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            priority: 0,
            run_at: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl EnqueueOptions {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Retry delay policy: exponential backoff with a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Growth factor per failed attempt.
    pub factor: u32,
    /// Upper bound on any computed delay.
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            factor: 2,
            cap: Duration::from_secs(3600),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry following the given failed attempt (1-indexed):
    /// `min(base * factor^(n-1), cap)`, so attempts 1, 2, 3 … wait 60 s,
    /// 120 s, 240 s … with the defaults, capped at one hour.
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        let exponent = attempt.max(1) as u32 - 1;
        let secs = self
            .base
            .as_secs()
            .saturating_mul((self.factor as u64).saturating_pow(exponent))
            .min(self.cap.as_secs());
        Duration::from_secs(secs)
    }
}

/// Terminal failure record.
///
/// Lives in its own table; re-entering the active queue requires operator
/// action (retry or delete).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJob {
    pub uuid: FailedJobId,
    /// Original job name as a dedicated column, so retry tooling does not
    /// have to parse it back out of the exception text.
    pub name: String,
    pub queue: String,
    /// Original payload, preserved verbatim for re-submission.
    pub payload: String,
    /// `"Job: {name}\n{error}"` — the name stays embedded in the text as
    /// well, for operator tooling that greps the exception.
    pub exception: String,
    pub failed_at: DateTime<Utc>,
}

impl FailedJob {
    /// Build the dead-letter record for a job, with a fresh id.
    pub fn from_job(job: &Job, error: &str) -> Self {
        Self {
            uuid: FailedJobId::new(),
            name: job.name.clone(),
            queue: job.queue.clone(),
            payload: job.payload.clone(),
            exception: format!("Job: {}\n{}", job.name, error),
            failed_at: Utc::now(),
        }
    }
}

/// Offset/limit pagination for the listing endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Filter for the active-job listing. Results are newest-first.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub queue: Option<String>,
    pub pagination: Pagination,
}

/// Filter for the dead-letter listing. Results are newest-first.
#[derive(Debug, Clone, Default)]
pub struct FailedJobFilter {
    pub queue: Option<String>,
    pub pagination: Pagination,
}

/// One page of listing results.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub has_more: bool,
}

/// Per-status totals for the dashboard poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub dead_lettered: u64,
}
