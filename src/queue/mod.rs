//! Durable job queue and the worker pool that drains it.
//!
//! * [`job`]: payload, states, snapshots and leases
//! * [`store`]: [`JobQueue`]: enqueue, lease/renew, complete/fail with
//!   backoff, cancellation, retention, JSON snapshot persistence
//! * [`worker`]: [`WorkerPool`]: bounded concurrency, rate-limited starts,
//!   lock renewal alongside the running handler, periodic cleaning
//!
//! # Example
//!
//! ```rust,no_run
//! use edgequake_pdf2tiles::{
//!     DocumentPipeline, InMemoryMetadataStore, JobQueue, PipelineConfig, StorageGateway,
//!     TileJobHandler, WorkerConfig, WorkerPool,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = Arc::new(JobQueue::open("queue.json").await?);
//! let pipeline = DocumentPipeline::with_process_runner(
//!     PipelineConfig::default(),
//!     StorageGateway::local("tiles-out")?,
//!     Arc::new(InMemoryMetadataStore::new()),
//! );
//! let pool = WorkerPool::new(queue, Arc::new(TileJobHandler::new(pipeline)), WorkerConfig::default());
//! let shutdown = CancellationToken::new();
//! pool.run(shutdown).await?;
//! # Ok(())
//! # }
//! ```

pub mod job;
pub mod store;
pub mod worker;

pub use job::{FailOutcome, JobCounts, JobPayload, JobSnapshot, JobState, Lease};
pub use store::{JobQueue, LOCK_EXPIRED};
pub use worker::{
    drain, JobHandler, NoopWorkerEvents, TileJobHandler, WorkerEvents, WorkerPool,
};
