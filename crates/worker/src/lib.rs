//! Worker side of the job queue: handler registration and the polling loop.
//!
//! A worker owns nothing but a [`HandlerRegistry`] and a queue handle. Each
//! iteration claims at most one job, dispatches it by name, and reports the
//! outcome back; all coordination with other workers happens through the
//! shared store. Run more worker processes (each with a distinct
//! [`WorkerId`](pagesmith_core::WorkerId)) to scale out.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use pagesmith_queue::{InMemoryJobStore, Queue};
//! use pagesmith_worker::{HandlerRegistry, NoOpHandler, Worker, WorkerConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let queue = Arc::new(Queue::new(InMemoryJobStore::arc()));
//!     let registry = HandlerRegistry::builder()
//!         .register(Arc::new(NoOpHandler::new("sitemap.generate")))
//!         .build();
//!
//!     let worker = Worker::new(queue, registry, WorkerConfig::default());
//!     let handle = worker.spawn();
//!     handle.shutdown().await;
//! }
//! ```

pub mod registry;
pub mod worker;

pub use registry::{HandlerRegistry, JobHandler, NoOpHandler, RegistryBuilder};
pub use worker::{Worker, WorkerConfig, WorkerHandle, WorkerStats};

// Re-export for handler implementations.
pub use async_trait::async_trait;
