//! The queue service: producer API, claim protocol, and failure policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use pagesmith_core::{FailedJobId, JobId, WorkerId};

use crate::store::{JobStore, StoreError};
use crate::types::{
    BackoffPolicy, EnqueueOptions, FailedJob, FailedJobFilter, Job, JobCounts, JobFilter, NewJob,
    Page,
};

/// Queue service error.
///
/// Producer-side errors propagate synchronously to the caller; job-level
/// failures never appear here (the worker converts them into store state).
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("dead-letter entry not found: {0}")]
    FailedJobNotFound(FailedJobId),
}

/// Tunables for the claim lease and retry delays.
///
/// The defaults are the system's fixed operating points; expose them through
/// configuration only if the deployment needs it, the observable default
/// behavior must not change.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// How long a claim lease is honored before any worker may reclaim.
    pub lease: Duration,
    /// Retry delay schedule.
    pub backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(90),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// The API producers and workers talk to.
///
/// Producers call [`enqueue`](Queue::enqueue); the worker loop calls
/// [`claim_next_job`](Queue::claim_next_job) and reports back through
/// [`complete_job`](Queue::complete_job) / [`fail_job`](Queue::fail_job);
/// operator tooling uses the listings and dead-letter operations.
#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
}

impl Queue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_config(store, QueueConfig::default())
    }

    pub fn with_config(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Insert one job in state `Queued` and return its id.
    ///
    /// The payload is serialized to a string for storage; the queue never
    /// interprets it. There is no dedup: duplicate enqueues create duplicate
    /// jobs by design, idempotence belongs to handlers.
    pub async fn enqueue<P>(
        &self,
        name: &str,
        payload: &P,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError>
    where
        P: Serialize + ?Sized,
    {
        if name.trim().is_empty() {
            return Err(QueueError::Validation(
                "job name must not be empty".to_string(),
            ));
        }

        let payload = serde_json::to_string(payload)?;
        let id = self
            .store
            .insert(NewJob {
                name: name.to_string(),
                payload,
                queue: options.queue,
                priority: options.priority,
                run_at: options.run_at.unwrap_or_else(Utc::now),
                max_attempts: options.max_attempts,
            })
            .await?;

        debug!(job_id = %id, job_name = name, "enqueued job");
        Ok(id)
    }

    /// Claim the next eligible job for `worker`, or `None` if nothing is
    /// due. Losing a claim race also yields `None`; neither is an error.
    pub async fn claim_next_job(&self, worker: &WorkerId) -> Result<Option<Job>, QueueError> {
        self.claim_next_job_at(worker, Utc::now()).await
    }

    /// Claim as of an explicit instant. Deterministic variant of
    /// [`claim_next_job`](Queue::claim_next_job); what the worker calls
    /// indirectly and tests call directly to step through time.
    pub async fn claim_next_job_at(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let claimed = self.store.claim_next(worker, now, self.config.lease).await?;
        if let Some(job) = &claimed {
            debug!(job_id = %job.id, job_name = %job.name, worker = %worker, attempt = job.attempts, "claimed job");
        }
        Ok(claimed)
    }

    /// Mark a job `Completed`. The row is retained for audit; completing an
    /// id that no longer exists is a silent no-op.
    pub async fn complete_job(&self, id: JobId) -> Result<(), QueueError> {
        if !self.store.mark_completed(id).await? {
            debug!(job_id = %id, "complete_job on missing id, ignoring");
        }
        Ok(())
    }

    /// Record a failure for a claimed job.
    ///
    /// With `retry` and attempts to spare, the job goes back to `Queued`
    /// with the lease cleared and `run_at` pushed out by the backoff
    /// schedule. Otherwise (attempts exhausted, or `retry=false` for
    /// non-retryable errors such as a missing handler) the job row is
    /// deleted and reborn as a dead-letter entry — terminal until an
    /// operator acts. Failing an id that no longer exists is a silent no-op.
    pub async fn fail_job(&self, id: JobId, error: &str, retry: bool) -> Result<(), QueueError> {
        let Some(job) = self.store.get(id).await? else {
            debug!(job_id = %id, "fail_job on missing id, ignoring");
            return Ok(());
        };

        if retry && job.attempts < job.max_attempts {
            let delay = self.config.backoff.delay_for_attempt(job.attempts);
            let run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            self.store.requeue(id, run_at, error).await?;
            debug!(
                job_id = %id,
                job_name = %job.name,
                attempt = job.attempts,
                delay_secs = delay.as_secs(),
                "job failed, requeued with backoff"
            );
        } else {
            let entry = FailedJob::from_job(&job, error);
            self.store.move_to_dead_letter(id, entry).await?;
            warn!(
                job_id = %id,
                job_name = %job.name,
                attempts = job.attempts,
                "job failed terminally, dead-lettered"
            );
        }

        Ok(())
    }

    /// Point lookup for operator tooling.
    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    /// Active jobs, newest-first, paginated. Read-only.
    pub async fn get_jobs(&self, filter: &JobFilter) -> Result<Page<Job>, QueueError> {
        Ok(self.store.list_jobs(filter).await?)
    }

    /// Dead-letter entries, newest-first, paginated. Read-only.
    pub async fn get_failed_jobs(
        &self,
        filter: &FailedJobFilter,
    ) -> Result<Page<FailedJob>, QueueError> {
        Ok(self.store.list_failed(filter).await?)
    }

    /// Re-enqueue a dead-lettered job with its original name and payload,
    /// then remove the dead-letter entry. Attempts start over.
    pub async fn retry_failed_job(&self, id: FailedJobId) -> Result<JobId, QueueError> {
        let Some(entry) = self.store.get_failed(id).await? else {
            return Err(QueueError::FailedJobNotFound(id));
        };

        // The payload is already its stored serialization; insert it
        // verbatim rather than round-tripping through enqueue.
        let job_id = self
            .store
            .insert(NewJob {
                name: entry.name.clone(),
                payload: entry.payload.clone(),
                queue: entry.queue.clone(),
                priority: 0,
                run_at: Utc::now(),
                max_attempts: crate::types::DEFAULT_MAX_ATTEMPTS,
            })
            .await?;
        self.store.delete_failed(id).await?;

        debug!(failed_job = %id, job_id = %job_id, job_name = %entry.name, "retried dead-lettered job");
        Ok(job_id)
    }

    /// Permanently delete a dead-letter entry. Returns whether it existed.
    pub async fn delete_failed_job(&self, id: FailedJobId) -> Result<bool, QueueError> {
        Ok(self.store.delete_failed(id).await?)
    }

    /// Per-status totals for the dashboard poll.
    pub async fn job_counts(&self) -> Result<JobCounts, QueueError> {
        Ok(self.store.counts().await?)
    }

    /// Retention sweep over `Completed` rows.
    pub async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64, QueueError> {
        Ok(self.store.purge_completed(older_than).await?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::InMemoryJobStore;
    use crate::types::JobStatus;

    fn queue() -> Queue {
        Queue::new(InMemoryJobStore::arc())
    }

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name)
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_names() {
        let queue = queue();
        let err = queue
            .enqueue("", &json!({}), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        let err = queue
            .enqueue("   ", &json!({}), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[tokio::test]
    async fn enqueue_applies_defaults_and_serializes_payload() {
        let queue = queue();
        let before = Utc::now();
        let id = queue
            .enqueue("cache.evict", &json!({"path": "/blog"}), EnqueueOptions::default())
            .await
            .unwrap();

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.name, "cache.evict");
        assert_eq!(job.queue, "default");
        assert_eq!(job.priority, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.run_at >= before);
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&job.payload).unwrap(),
            json!({"path": "/blog"})
        );
    }

    #[tokio::test]
    async fn duplicate_enqueues_create_duplicate_jobs() {
        let queue = queue();
        let a = queue
            .enqueue("sitemap.generate", &json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let b = queue
            .enqueue("sitemap.generate", &json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(queue.job_counts().await.unwrap().queued, 2);
    }

    #[tokio::test]
    async fn failed_job_with_attempts_left_is_requeued_with_backoff() {
        let queue = queue();
        let id = queue
            .enqueue("img.resize", &json!({"id": 9}), EnqueueOptions::default())
            .await
            .unwrap();

        queue.claim_next_job(&worker("w")).await.unwrap().unwrap();

        let before = Utc::now();
        queue.fail_job(id, "resize crashed", true).await.unwrap();
        let after = Utc::now();

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.locked_at, None);
        assert_eq!(job.locked_by, None);
        assert_eq!(job.last_error.as_deref(), Some("resize crashed"));

        // First failure waits the 60 s base delay.
        assert!(job.run_at >= before + chrono::Duration::seconds(60));
        assert!(job.run_at <= after + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn exhausted_attempts_dead_letter_with_name_in_exception() {
        let queue = queue();
        let id = queue
            .enqueue(
                "backup.run",
                &json!({"target": "s3"}),
                EnqueueOptions::default().with_max_attempts(1),
            )
            .await
            .unwrap();

        queue.claim_next_job(&worker("w")).await.unwrap().unwrap();
        queue.fail_job(id, "bucket unreachable", true).await.unwrap();

        assert!(queue.get_job(id).await.unwrap().is_none());

        let failed = queue
            .get_failed_jobs(&FailedJobFilter::default())
            .await
            .unwrap();
        assert_eq!(failed.total, 1);
        let entry = &failed.items[0];
        assert_eq!(entry.name, "backup.run");
        assert_eq!(entry.queue, "default");
        assert!(entry.exception.contains("backup.run"));
        assert!(entry.exception.contains("bucket unreachable"));
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&entry.payload).unwrap(),
            json!({"target": "s3"})
        );
    }

    #[tokio::test]
    async fn non_retryable_failure_dead_letters_immediately() {
        let queue = queue();
        let id = queue
            .enqueue("ghost.job", &json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        queue.claim_next_job(&worker("w")).await.unwrap().unwrap();

        // retry=false skips the remaining attempts entirely.
        queue
            .fail_job(id, "no handler registered for job 'ghost.job'", false)
            .await
            .unwrap();

        assert!(queue.get_job(id).await.unwrap().is_none());
        assert_eq!(queue.job_counts().await.unwrap().dead_lettered, 1);
    }

    #[tokio::test]
    async fn complete_and_fail_are_noops_on_missing_ids() {
        let queue = queue();
        let gone = JobId::from_i64(12345);

        queue.complete_job(gone).await.unwrap();
        queue.fail_job(gone, "late", true).await.unwrap();
        queue.fail_job(gone, "late", false).await.unwrap();

        assert_eq!(queue.job_counts().await.unwrap(), JobCounts::default());
    }

    #[tokio::test]
    async fn retry_failed_job_reenqueues_original_payload() {
        let queue = queue();
        let id = queue
            .enqueue(
                "mail.digest",
                &json!({"week": 31}),
                EnqueueOptions::default().with_queue("mail").with_max_attempts(1),
            )
            .await
            .unwrap();
        queue.claim_next_job(&worker("w")).await.unwrap().unwrap();
        queue.fail_job(id, "smtp down", true).await.unwrap();

        let entry = queue
            .get_failed_jobs(&FailedJobFilter::default())
            .await
            .unwrap()
            .items
            .remove(0);

        let new_id = queue.retry_failed_job(entry.uuid).await.unwrap();
        assert_ne!(new_id, id);

        let job = queue.get_job(new_id).await.unwrap().unwrap();
        assert_eq!(job.name, "mail.digest");
        assert_eq!(job.queue, "mail");
        assert_eq!(job.attempts, 0);
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&job.payload).unwrap(),
            json!({"week": 31})
        );

        // The dead-letter entry is consumed.
        assert_eq!(queue.job_counts().await.unwrap().dead_lettered, 0);
        let err = queue.retry_failed_job(entry.uuid).await.unwrap_err();
        assert!(matches!(err, QueueError::FailedJobNotFound(_)));
    }

    #[tokio::test]
    async fn delete_failed_job_is_permanent() {
        let queue = queue();
        let id = queue
            .enqueue(
                "log.rotate",
                &json!({}),
                EnqueueOptions::default().with_max_attempts(1),
            )
            .await
            .unwrap();
        queue.claim_next_job(&worker("w")).await.unwrap().unwrap();
        queue.fail_job(id, "disk full", true).await.unwrap();

        let entry = queue
            .get_failed_jobs(&FailedJobFilter::default())
            .await
            .unwrap()
            .items
            .remove(0);

        assert!(queue.delete_failed_job(entry.uuid).await.unwrap());
        assert!(!queue.delete_failed_job(entry.uuid).await.unwrap());
        assert_eq!(queue.job_counts().await.unwrap().dead_lettered, 0);
    }

    #[tokio::test]
    async fn racing_claims_yield_exactly_one_winner() {
        let queue = Arc::new(queue());
        queue
            .enqueue("solo.job", &json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .claim_next_job(&WorkerId::new(format!("w{i}")))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    /// The two-failure lifecycle: enqueue with `max_attempts=2`, fail once
    /// (requeued ~60 s out), fail again (dead-lettered with the payload
    /// intact).
    #[tokio::test]
    async fn two_failures_exhaust_a_two_attempt_job() {
        let queue = queue();
        let id = queue
            .enqueue(
                "test.job",
                &json!({"x": 1}),
                EnqueueOptions::default().with_max_attempts(2),
            )
            .await
            .unwrap();

        let w = worker("w1");

        // First attempt fails: back to Queued, one attempt down.
        let claimed = queue.claim_next_job(&w).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        queue.fail_job(id, "boom", true).await.unwrap();

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        let eta = job.run_at;

        // Not claimable until run_at passes; claimable right after.
        assert!(queue
            .claim_next_job_at(&w, eta - chrono::Duration::seconds(1))
            .await
            .unwrap()
            .is_none());
        let reclaimed = queue
            .claim_next_job_at(&w, eta + chrono::Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.attempts, 2);

        // Second failure exhausts max_attempts=2: job row gone, one
        // dead-letter entry carrying the original payload.
        queue.fail_job(id, "boom again", true).await.unwrap();
        assert!(queue.get_job(id).await.unwrap().is_none());

        let failed = queue
            .get_failed_jobs(&FailedJobFilter::default())
            .await
            .unwrap();
        assert_eq!(failed.total, 1);
        assert_eq!(failed.items[0].payload, r#"{"x":1}"#);
        assert!(failed.items[0].exception.contains("test.job"));
    }
}
