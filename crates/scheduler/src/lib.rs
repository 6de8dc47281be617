//! Recurring job production for the CMS.
//!
//! The scheduler is the queue's primary internal producer: on fixed
//! cron-style triggers it enqueues the recurring maintenance jobs (sitemap
//! generation, cache cleanup, backups, analytics aggregation, log cleanup).
//! It holds no state of its own and never claims — the queue core knows
//! nothing about schedules.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use pagesmith_queue::{InMemoryJobStore, Queue};
//! use pagesmith_scheduler::{default_schedules, Scheduler};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let queue = Arc::new(Queue::new(InMemoryJobStore::arc()));
//!     let handle = Scheduler::with_entries(queue, default_schedules())
//!         .start()
//!         .await
//!         .unwrap();
//!     handle.shutdown().await.unwrap();
//! }
//! ```

pub mod schedule;
pub mod scheduler;

pub use schedule::{default_schedules, PayloadFactory, ScheduleEntry};
pub use scheduler::{Scheduler, SchedulerError, SchedulerHandle};
