//! The worker polling loop.
//!
//! One claim per iteration: claim, dispatch to the registered handler,
//! report the outcome back to the queue. Job-level errors are swallowed
//! into store state transitions (retry or dead-letter); only store-level
//! errors reach the loop, which logs, backs off, and keeps going. The loop
//! never exits because of a single job or a transient store failure.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pagesmith_core::{JobId, WorkerId};
use pagesmith_queue::{Job, Queue, QueueError};

use crate::registry::HandlerRegistry;

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity recorded in claim leases. Distinct per worker process.
    pub worker_id: WorkerId,
    /// Sleep between polls when no job is due.
    pub poll_interval: Duration,
    /// Longer sleep after a store-level failure.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::generate(),
            poll_interval: Duration::from_secs(3),
            error_backoff: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }
}

/// Worker runtime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
}

/// Outcome of a single loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Succeeded,
    /// Failed with attempts to spare; requeued.
    Retried,
    /// Failed terminally (attempts exhausted or no handler registered).
    DeadLettered,
}

/// A single-slot polling worker.
///
/// Horizontal scaling is running more worker processes, each with its own
/// `WorkerId`; coordination happens entirely through the shared store.
pub struct Worker {
    queue: Arc<Queue>,
    registry: HandlerRegistry,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Worker {
    pub fn new(queue: Arc<Queue>, registry: HandlerRegistry, config: WorkerConfig) -> Self {
        Self {
            queue,
            registry,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    pub fn stats(&self) -> WorkerStats {
        *self.stats.lock().unwrap()
    }

    /// Run one iteration: claim at most one job and dispatch it.
    ///
    /// `Ok(Some(id))` when a job was claimed (whatever its outcome),
    /// `Ok(None)` when nothing was due, `Err` only for store-level failures.
    pub async fn run_once(&self) -> Result<Option<JobId>, QueueError> {
        let Some(job) = self.queue.claim_next_job(&self.config.worker_id).await? else {
            return Ok(None);
        };

        let id = job.id;
        let outcome = self.dispatch(job).await?;

        let mut stats = self.stats.lock().unwrap();
        stats.jobs_processed += 1;
        match outcome {
            Dispatch::Succeeded => stats.jobs_succeeded += 1,
            Dispatch::Retried => stats.jobs_failed += 1,
            Dispatch::DeadLettered => {
                stats.jobs_failed += 1;
                stats.jobs_dead_lettered += 1;
            }
        }

        Ok(Some(id))
    }

    async fn dispatch(&self, job: Job) -> Result<Dispatch, QueueError> {
        let Some(handler) = self.registry.get(&job.name) else {
            // Retrying cannot fix a missing registration; dead-letter now.
            let message = format!("no handler registered for job '{}'", job.name);
            warn!(job_id = %job.id, job_name = %job.name, "no handler for claimed job");
            self.queue.fail_job(job.id, &message, false).await?;
            return Ok(Dispatch::DeadLettered);
        };

        let payload = match serde_json::from_str(&job.payload) {
            Ok(value) => value,
            Err(e) => {
                let message = format!("payload parse failed: {e}");
                self.queue.fail_job(job.id, &message, true).await?;
                return Ok(self.retry_outcome(&job));
            }
        };

        match handler.execute(payload).await {
            Ok(()) => {
                self.queue.complete_job(job.id).await?;
                debug!(job_id = %job.id, job_name = %job.name, "job completed");
                Ok(Dispatch::Succeeded)
            }
            Err(e) => {
                let message = format!("{e:#}");
                debug!(job_id = %job.id, job_name = %job.name, error = %message, "job failed");
                self.queue.fail_job(job.id, &message, true).await?;
                Ok(self.retry_outcome(&job))
            }
        }
    }

    /// Whether a retryable failure of this claim requeues or dead-letters.
    /// The claimed snapshot already carries the incremented attempt count.
    fn retry_outcome(&self, job: &Job) -> Dispatch {
        if job.attempts < job.max_attempts {
            Dispatch::Retried
        } else {
            Dispatch::DeadLettered
        }
    }

    /// Run until cancelled.
    ///
    /// Sleeps `poll_interval` when the queue is idle and `error_backoff`
    /// after a store-level failure; both sleeps wake early on shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker = %self.config.worker_id, handlers = self.registry.len(), "worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_once().await {
                Ok(Some(_)) => {
                    // Claimed and dispatched; poll again immediately.
                }
                Ok(None) => {
                    self.sleep(self.config.poll_interval, &shutdown).await;
                }
                Err(e) => {
                    error!(worker = %self.config.worker_id, error = %e, "queue unreachable, backing off");
                    self.sleep(self.config.error_backoff, &shutdown).await;
                }
            }
        }

        info!(worker = %self.config.worker_id, "worker stopped");
    }

    async fn sleep(&self, duration: Duration, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Spawn the loop on the current runtime.
    pub fn spawn(self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let stats = self.stats.clone();
        let token = shutdown.clone();
        let join = tokio::spawn(async move {
            self.run(token).await;
        });

        WorkerHandle {
            shutdown,
            join,
            stats,
        }
    }
}

/// Handle to a spawned worker.
pub struct WorkerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request shutdown and wait for the loop to finish its iteration.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.join.await;
    }

    pub fn stats(&self) -> WorkerStats {
        *self.stats.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use pagesmith_queue::{EnqueueOptions, InMemoryJobStore, JobStatus};

    use super::*;
    use crate::registry::{JobHandler, NoOpHandler};

    fn queue() -> Arc<Queue> {
        Arc::new(Queue::new(InMemoryJobStore::arc()))
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig::default()
            .with_worker_id(WorkerId::new("test-worker"))
            .with_poll_interval(Duration::from_millis(10))
            .with_error_backoff(Duration::from_millis(10))
    }

    struct Failing {
        name: &'static str,
    }

    #[async_trait]
    impl JobHandler for Failing {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _payload: Value) -> anyhow::Result<()> {
            anyhow::bail!("handler exploded")
        }
    }

    struct Recording {
        name: &'static str,
        calls: Arc<AtomicU32>,
        expected: Value,
    }

    #[async_trait]
    impl JobHandler for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, payload: Value) -> anyhow::Result<()> {
            assert_eq!(payload, self.expected);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_once_with_empty_queue_claims_nothing() {
        let worker = Worker::new(queue(), HandlerRegistry::default(), test_config());
        assert_eq!(worker.run_once().await.unwrap(), None);
        assert_eq!(worker.stats(), WorkerStats::default());
    }

    #[tokio::test]
    async fn successful_dispatch_completes_the_job() {
        let queue = queue();
        let calls = Arc::new(AtomicU32::new(0));
        let registry = HandlerRegistry::builder()
            .register(Arc::new(Recording {
                name: "thumb.render",
                calls: calls.clone(),
                expected: json!({"w": 640}),
            }))
            .build();

        let id = queue
            .enqueue("thumb.render", &json!({"w": 640}), EnqueueOptions::default())
            .await
            .unwrap();

        let worker = Worker::new(queue.clone(), registry, test_config());
        assert_eq!(worker.run_once().await.unwrap(), Some(id));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            worker.stats(),
            WorkerStats {
                jobs_processed: 1,
                jobs_succeeded: 1,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn handler_error_requeues_with_the_message() {
        let queue = queue();
        let registry = HandlerRegistry::builder()
            .register(Arc::new(Failing { name: "feed.sync" }))
            .build();

        let id = queue
            .enqueue("feed.sync", &json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let worker = Worker::new(queue.clone(), registry, test_config());
        worker.run_once().await.unwrap();

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        assert!(job.run_at > chrono::Utc::now());
        assert!(job.last_error.as_deref().unwrap().contains("handler exploded"));
        assert_eq!(worker.stats().jobs_failed, 1);
        assert_eq!(worker.stats().jobs_dead_lettered, 0);
    }

    #[tokio::test]
    async fn final_attempt_failure_dead_letters() {
        let queue = queue();
        let registry = HandlerRegistry::builder()
            .register(Arc::new(Failing { name: "feed.sync" }))
            .build();

        let id = queue
            .enqueue(
                "feed.sync",
                &json!({}),
                EnqueueOptions::default().with_max_attempts(1),
            )
            .await
            .unwrap();

        let worker = Worker::new(queue.clone(), registry, test_config());
        worker.run_once().await.unwrap();

        assert!(queue.get_job(id).await.unwrap().is_none());
        assert_eq!(queue.job_counts().await.unwrap().dead_lettered, 1);
        assert_eq!(
            worker.stats(),
            WorkerStats {
                jobs_processed: 1,
                jobs_failed: 1,
                jobs_dead_lettered: 1,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn unregistered_name_dead_letters_without_retry() {
        let queue = queue();
        let registry = HandlerRegistry::builder()
            .register(Arc::new(NoOpHandler::new("known.job")))
            .build();

        // Plenty of attempts left; retrying still cannot fix a missing
        // registration.
        let id = queue
            .enqueue("unknown.job", &json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let worker = Worker::new(queue.clone(), registry, test_config());
        worker.run_once().await.unwrap();

        assert!(queue.get_job(id).await.unwrap().is_none());
        let failed = queue
            .get_failed_jobs(&Default::default())
            .await
            .unwrap();
        assert_eq!(failed.total, 1);
        assert!(failed.items[0]
            .exception
            .contains("no handler registered for job 'unknown.job'"));
    }

    #[tokio::test]
    async fn spawned_worker_drains_and_shuts_down() {
        let queue = queue();
        let calls = Arc::new(AtomicU32::new(0));
        let registry = HandlerRegistry::builder()
            .register(Arc::new(Recording {
                name: "cache.cleanup",
                calls: calls.clone(),
                expected: json!({}),
            }))
            .build();

        for _ in 0..3 {
            queue
                .enqueue("cache.cleanup", &json!({}), EnqueueOptions::default())
                .await
                .unwrap();
        }

        let handle = Worker::new(queue.clone(), registry, test_config()).spawn();

        // The loop polls every 10 ms in tests; give it a moment to drain.
        for _ in 0..100 {
            if handle.stats().jobs_processed == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.job_counts().await.unwrap().completed, 3);
    }
}
