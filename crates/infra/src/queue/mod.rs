//! Idempotent work queue.
//!
//! ## Design
//!
//! - A work item is keyed by (`job_type`, `entity_id`)
//! - At most one `pending`/`running` row per key; enqueueing an active key
//!   returns the existing row instead of inserting
//! - `pending -> running -> done | error`; `error -> pending` only through
//!   an explicit `requeue_errored` pass with a [`RetryPolicy`]
//! - Once a key's row is `done` or `error`, a new enqueue creates a new row
//!
//! ## Components
//!
//! - `WorkQueueStore`: the persistence contract (in-memory, Postgres)
//! - `QueueWorker`: claims batches and dispatches items to per-type handlers
//!
//! ## Example
//!
//! ```ignore
//! let queue = InMemoryWorkQueueStore::arc();
//! let mut worker = QueueWorker::new(queue.clone());
//! worker.register_handler(JobType::PatchSummary, |item| async move {
//!     summarize_patch(&item.entity_id).await
//! });
//!
//! queue.enqueue(JobType::PatchSummary, "game-1").await?;
//! let report = worker.run_batch().await?;
//! ```

pub mod in_memory;
pub mod postgres;
pub mod store;
pub mod types;
pub mod worker;

pub use in_memory::InMemoryWorkQueueStore;
pub use postgres::PostgresWorkQueueStore;
pub use store::WorkQueueStore;
pub use types::{BackoffStrategy, EnqueueReceipt, QueueError, QueueStats, RetryPolicy};
pub use worker::{BatchReport, DEFAULT_BATCH_SIZE, QueueWorker, WorkHandler};
