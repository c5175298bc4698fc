//! Batch worker: claims work items and dispatches them to per-type handlers.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{Instrument, debug, error, info, info_span, warn};

use questlog_core::{JobType, WorkItem, WorkOutcome};

use super::store::WorkQueueStore;
use super::types::QueueError;
use crate::lease::{LeaseLock, LeaseStore, LockOutcome};

/// Default number of items claimed per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Work item handler function type.
pub type WorkHandler =
    Box<dyn Fn(WorkItem) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Summary of one `run_batch` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Claims batches from a [`WorkQueueStore`] and runs the registered handler
/// for each item.
///
/// Items are processed one after another; a failing or panicking handler only
/// marks its own item as `error`.
pub struct QueueWorker<Q> {
    queue: Q,
    handlers: HashMap<JobType, WorkHandler>,
    batch_size: usize,
}

impl<Q: WorkQueueStore> QueueWorker<Q> {
    pub fn new(queue: Q) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Register a handler for a job type, replacing any previous one.
    pub fn register_handler<F, Fut>(&mut self, job_type: JobType, handler: F)
    where
        F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers
            .insert(job_type, Box::new(move |item| handler(item).boxed()));
    }

    /// Claim up to `batch_size` items and run each to completion.
    ///
    /// Only a failed claim is an error; per-item failures end up in the report.
    pub async fn run_batch(&self) -> Result<BatchReport, QueueError> {
        let items = self.queue.claim_batch(self.batch_size).await?;
        let mut report = BatchReport {
            claimed: items.len(),
            ..BatchReport::default()
        };
        if items.is_empty() {
            debug!("no pending work items");
            return Ok(report);
        }

        for item in items {
            let span = info_span!(
                "work_item",
                id = %item.id,
                job_type = %item.job_type,
                entity_id = %item.entity_id,
                attempt = item.attempts
            );
            if self.process(item).instrument(span).await {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            claimed = report.claimed,
            succeeded = report.succeeded,
            failed = report.failed,
            "work batch finished"
        );
        Ok(report)
    }

    /// `run_batch` under the named lease; skipped when another process holds it.
    pub async fn run_exclusive<L: LeaseStore>(
        &self,
        lock: &LeaseLock<L>,
        job_name: &str,
        ttl: Duration,
    ) -> Result<LockOutcome<BatchReport>, QueueError> {
        lock.with_lock(job_name, ttl, || self.run_batch()).await
    }

    /// Run one item and record its outcome; `true` when it ended `done`.
    async fn process(&self, item: WorkItem) -> bool {
        let id = item.id;
        let outcome = self.execute(item).await;
        if let WorkOutcome::Error(message) = &outcome {
            warn!(error = %message, "work item failed");
        }

        match self.queue.complete(id, &outcome).await {
            Ok(_) if outcome == WorkOutcome::Done => {
                debug!("work item done");
                true
            }
            Ok(_) => false,
            Err(e) => {
                error!(error = %e, "failed to record work item completion");
                false
            }
        }
    }

    async fn execute(&self, item: WorkItem) -> WorkOutcome {
        let Some(handler) = self.handlers.get(&item.job_type) else {
            return WorkOutcome::Error(format!("no handler registered for {}", item.job_type));
        };

        match AssertUnwindSafe(handler(item)).catch_unwind().await {
            Ok(Ok(())) => WorkOutcome::Done,
            Ok(Err(e)) => WorkOutcome::Error(format!("{e:#}")),
            Err(panic) => {
                WorkOutcome::Error(format!("handler panicked: {}", panic_message(&*panic)))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
