//! Job storage abstraction and the in-memory store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pagesmith_core::{FailedJobId, JobId, WorkerId};

use crate::types::{
    FailedJob, FailedJobFilter, Job, JobCounts, JobFilter, JobStatus, NewJob, Page,
};

/// Durable storage for jobs and dead-letter entries.
///
/// Implementations must make `claim_next` atomic with respect to concurrent
/// callers: selection and mutation happen in one critical section or
/// transaction, so two workers racing for the same job can never both win.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in state `Queued`; the store assigns the id.
    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError>;

    /// Point lookup. `None` when the id is not in the active table.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Claim the next eligible job for `worker` as of `now`.
    ///
    /// Eligible: not `Completed`, `run_at <= now`, and the lease is either
    /// absent or older than `lease` (expired leases are how a crashed
    /// worker's job becomes claimable again). Ordering: `run_at` ascending,
    /// then `priority` descending, then `id` ascending. The winning row is
    /// mutated in the same critical section: status → `Processing`,
    /// `locked_at = now`, `locked_by = worker`, `attempts += 1`.
    ///
    /// `None` when nothing is eligible; callers must not treat that as an
    /// error.
    async fn claim_next(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError>;

    /// Set status to `Completed`, keeping the row for audit.
    /// Returns `false` when the id is gone (not an error).
    async fn mark_completed(&self, id: JobId) -> Result<bool, StoreError>;

    /// Put a claimed job back in `Queued`: clear the lease, record the
    /// error, and defer the next claim until `run_at`.
    /// Returns `false` when the id is gone (not an error).
    async fn requeue(
        &self,
        id: JobId,
        run_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, StoreError>;

    /// Delete the job row and insert `entry` in the dead-letter table, as
    /// one atomic step. When the job row is already gone, inserts nothing
    /// and returns `false`.
    async fn move_to_dead_letter(&self, id: JobId, entry: FailedJob) -> Result<bool, StoreError>;

    /// Active jobs, newest-first, paginated.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Page<Job>, StoreError>;

    /// Dead-letter entries, newest-first, paginated.
    async fn list_failed(&self, filter: &FailedJobFilter) -> Result<Page<FailedJob>, StoreError>;

    /// Point lookup in the dead-letter table.
    async fn get_failed(&self, id: FailedJobId) -> Result<Option<FailedJob>, StoreError>;

    /// Permanently delete a dead-letter entry. Returns `false` when absent.
    async fn delete_failed(&self, id: FailedJobId) -> Result<bool, StoreError>;

    /// Per-status totals plus the dead-letter count.
    async fn counts(&self) -> Result<JobCounts, StoreError>;

    /// Delete `Completed` rows created before `older_than`; returns how many
    /// were removed. Retention is operational, not a correctness concern.
    async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The backing store failed or is unreachable.
    #[error("storage error: {0}")]
    Storage(String),

    /// A stored row could not be decoded (e.g. unknown status text).
    #[error("row decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Default)]
struct InMemoryState {
    next_id: i64,
    jobs: BTreeMap<JobId, Job>,
    dead_letters: BTreeMap<FailedJobId, FailedJob>,
}

/// In-memory job store for tests and development.
///
/// A single mutex makes every operation a critical section, so the claim
/// protocol is trivially atomic. The `BTreeMap` keeps rows in id order,
/// which the claim tie-break and the listings rely on.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn claim_eligible(job: &Job, now: DateTime<Utc>, lease_expiry: DateTime<Utc>) -> bool {
    if job.status == JobStatus::Completed || job.run_at > now {
        return false;
    }
    match job.locked_at {
        None => true,
        Some(locked_at) => locked_at < lease_expiry,
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = JobId::from_i64(state.next_id);

        state.jobs.insert(
            id,
            Job {
                id,
                name: job.name,
                payload: job.payload,
                queue: job.queue,
                priority: job.priority,
                status: JobStatus::Queued,
                run_at: job.run_at,
                attempts: 0,
                max_attempts: job.max_attempts,
                locked_at: None,
                locked_by: None,
                last_error: None,
                created_at: Utc::now(),
            },
        );

        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.jobs.get(&id).cloned())
    }

    async fn claim_next(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let lease_expiry = now - chrono::Duration::from_std(lease).unwrap_or_default();

        // BTreeMap iterates in id order, so min_by on (run_at, -priority)
        // resolves equal keys to the lowest id.
        let winner = state
            .jobs
            .values()
            .filter(|j| claim_eligible(j, now, lease_expiry))
            .min_by(|a, b| {
                a.run_at
                    .cmp(&b.run_at)
                    .then(b.priority.cmp(&a.priority))
                    .then(a.id.cmp(&b.id))
            })
            .map(|j| j.id);

        let Some(id) = winner else {
            return Ok(None);
        };

        let job = state.jobs.get_mut(&id).expect("winner selected above");
        job.status = JobStatus::Processing;
        job.locked_at = Some(now);
        job.locked_by = Some(worker.clone());
        job.attempts += 1;

        Ok(Some(job.clone()))
    }

    async fn mark_completed(&self, id: JobId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.get_mut(&id) {
            Some(job) => {
                job.status = JobStatus::Completed;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn requeue(
        &self,
        id: JobId,
        run_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.get_mut(&id) {
            Some(job) => {
                job.status = JobStatus::Queued;
                job.run_at = run_at;
                job.locked_at = None;
                job.locked_by = None;
                job.last_error = Some(last_error.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn move_to_dead_letter(&self, id: JobId, entry: FailedJob) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.jobs.remove(&id).is_none() {
            return Ok(false);
        }
        state.dead_letters.insert(entry.uuid, entry);
        Ok(true)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Page<Job>, StoreError> {
        let state = self.state.lock().unwrap();

        let mut items: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .filter(|j| filter.queue.as_deref().is_none_or(|q| j.queue == q))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = items.len() as u64;
        let offset = filter.pagination.offset as usize;
        let limit = filter.pagination.limit as usize;
        let items: Vec<Job> = items.into_iter().skip(offset).take(limit).collect();
        let has_more = total > (offset + limit) as u64;

        Ok(Page {
            items,
            total,
            has_more,
        })
    }

    async fn list_failed(&self, filter: &FailedJobFilter) -> Result<Page<FailedJob>, StoreError> {
        let state = self.state.lock().unwrap();

        let mut items: Vec<FailedJob> = state
            .dead_letters
            .values()
            .filter(|f| filter.queue.as_deref().is_none_or(|q| f.queue == q))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));

        let total = items.len() as u64;
        let offset = filter.pagination.offset as usize;
        let limit = filter.pagination.limit as usize;
        let items: Vec<FailedJob> = items.into_iter().skip(offset).take(limit).collect();
        let has_more = total > (offset + limit) as u64;

        Ok(Page {
            items,
            total,
            has_more,
        })
    }

    async fn get_failed(&self, id: FailedJobId) -> Result<Option<FailedJob>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.dead_letters.get(&id).cloned())
    }

    async fn delete_failed(&self, id: FailedJobId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        Ok(state.dead_letters.remove(&id).is_some())
    }

    async fn counts(&self) -> Result<JobCounts, StoreError> {
        let state = self.state.lock().unwrap();
        let mut counts = JobCounts::default();

        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
            }
        }
        counts.dead_lettered = state.dead_letters.len() as u64;

        Ok(counts)
    }

    async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, j| !(j.status == JobStatus::Completed && j.created_at < older_than));
        Ok((before - state.jobs.len()) as u64)
    }
}
