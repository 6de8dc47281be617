//! Database-backed job queue with at-least-once delivery.
//!
//! Jobs live in a single table and move through `Queued` → `Processing` →
//! `Completed`; terminal failures leave the table and become dead-letter
//! rows. Workers coordinate only through the store: claiming is atomic, a
//! 90-second lease recovers jobs from crashed workers, and retries back off
//! exponentially (60 s doubling, capped at one hour).
//!
//! # Components
//!
//! - [`Queue`] — the service producers and workers talk to
//! - [`JobStore`] — storage abstraction behind the service
//! - [`InMemoryJobStore`] — single-process store for tests and development
//! - [`PostgresJobStore`] — the production store (`FOR UPDATE SKIP LOCKED`
//!   claim protocol)
//!
//! # Example
//!
//! ```rust
//! use pagesmith_core::WorkerId;
//! use pagesmith_queue::{EnqueueOptions, InMemoryJobStore, Queue};
//! use serde_json::json;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let queue = Queue::new(InMemoryJobStore::arc());
//!
//!     let id = queue
//!         .enqueue("sitemap.generate", &json!({}), EnqueueOptions::default())
//!         .await
//!         .unwrap();
//!
//!     let worker = WorkerId::generate();
//!     let job = queue.claim_next_job(&worker).await.unwrap().unwrap();
//!     assert_eq!(job.id, id);
//!
//!     queue.complete_job(job.id).await.unwrap();
//! }
//! ```
//!
//! Delivery is at-least-once, not exactly-once: a slow worker whose lease
//! expires can end up running a job concurrently with the worker that
//! reclaimed it. Handlers own idempotence.

pub mod postgres;
pub mod queue;
pub mod store;
pub mod types;

pub use postgres::PostgresJobStore;
pub use queue::{Queue, QueueConfig, QueueError};
pub use store::{InMemoryJobStore, JobStore, StoreError};
pub use types::{
    BackoffPolicy, EnqueueOptions, FailedJob, FailedJobFilter, Job, JobCounts, JobFilter,
    JobStatus, NewJob, Page, Pagination, DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE,
};
