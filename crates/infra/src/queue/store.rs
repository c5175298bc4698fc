//! Work queue store contract.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use questlog_core::{JobType, WorkItem, WorkItemId, WorkOutcome};

use super::types::{EnqueueReceipt, QueueError, QueueStats, RetryPolicy};

/// Persistence for work items.
///
/// Implementations uphold one invariant: at most one row with status
/// `pending` or `running` per (`job_type`, `entity_id`).
#[async_trait]
pub trait WorkQueueStore: Send + Sync {
    /// Return the active row for the key, or insert a new `pending` one.
    ///
    /// The check and the insert must behave as one atomic step.
    async fn enqueue(&self, job_type: JobType, entity_id: &str)
    -> Result<EnqueueReceipt, QueueError>;

    /// Move up to `max_count` of the oldest `pending` rows to `running` and return them.
    ///
    /// Concurrent callers never receive the same row.
    async fn claim_batch(&self, max_count: usize) -> Result<Vec<WorkItem>, QueueError>;

    /// `running -> done | error`.
    async fn complete(&self, id: WorkItemId, outcome: &WorkOutcome)
    -> Result<WorkItem, QueueError>;

    /// Get a work item by ID.
    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, QueueError>;

    /// Every row ever recorded for a key, oldest first.
    async fn list_for_key(
        &self,
        job_type: JobType,
        entity_id: &str,
    ) -> Result<Vec<WorkItem>, QueueError>;

    /// Move `error` rows that `policy` considers due back to `pending`.
    ///
    /// Rows whose key already has an active row are left alone.
    async fn requeue_errored(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItemId>, QueueError>;

    /// Get queue statistics.
    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

#[async_trait]
impl<S: WorkQueueStore + ?Sized> WorkQueueStore for Arc<S> {
    async fn enqueue(
        &self,
        job_type: JobType,
        entity_id: &str,
    ) -> Result<EnqueueReceipt, QueueError> {
        (**self).enqueue(job_type, entity_id).await
    }

    async fn claim_batch(&self, max_count: usize) -> Result<Vec<WorkItem>, QueueError> {
        (**self).claim_batch(max_count).await
    }

    async fn complete(
        &self,
        id: WorkItemId,
        outcome: &WorkOutcome,
    ) -> Result<WorkItem, QueueError> {
        (**self).complete(id, outcome).await
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, QueueError> {
        (**self).get(id).await
    }

    async fn list_for_key(
        &self,
        job_type: JobType,
        entity_id: &str,
    ) -> Result<Vec<WorkItem>, QueueError> {
        (**self).list_for_key(job_type, entity_id).await
    }

    async fn requeue_errored(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItemId>, QueueError> {
        (**self).requeue_errored(policy, now).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        (**self).stats().await
    }
}
