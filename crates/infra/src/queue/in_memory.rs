use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use questlog_core::{JobType, WorkItem, WorkItemId, WorkOutcome, validate_entity_id};

use super::store::WorkQueueStore;
use super::types::{EnqueueReceipt, QueueError, QueueStats, RetryPolicy};

/// In-memory work queue for tests/dev.
///
/// Every operation takes the single write lock for its whole duration, which
/// gives `enqueue` and `claim_batch` the same atomicity the Postgres store gets
/// from its partial unique index and `SKIP LOCKED`.
#[derive(Debug, Default)]
pub struct InMemoryWorkQueueStore {
    items: RwLock<HashMap<WorkItemId, WorkItem>>,
}

impl InMemoryWorkQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> QueueError {
        QueueError::Storage("work item table lock poisoned".to_string())
    }
}

fn oldest_first(a: &WorkItem, b: &WorkItem) -> std::cmp::Ordering {
    a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))
}

#[async_trait]
impl WorkQueueStore for InMemoryWorkQueueStore {
    async fn enqueue(
        &self,
        job_type: JobType,
        entity_id: &str,
    ) -> Result<EnqueueReceipt, QueueError> {
        validate_entity_id(entity_id)?;
        let mut items = self.items.write().map_err(|_| Self::poisoned())?;

        if let Some(active) = items
            .values()
            .find(|w| w.status.is_active() && w.is_key(job_type, entity_id))
        {
            return Ok(EnqueueReceipt {
                id: active.id,
                created: false,
            });
        }

        let item = WorkItem::new(job_type, entity_id, Utc::now())?;
        let id = item.id;
        items.insert(id, item);
        Ok(EnqueueReceipt { id, created: true })
    }

    async fn claim_batch(&self, max_count: usize) -> Result<Vec<WorkItem>, QueueError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let mut items = self.items.write().map_err(|_| Self::poisoned())?;
        let now = Utc::now();

        let mut candidates: Vec<&WorkItem> = items
            .values()
            .filter(|w| w.status == questlog_core::WorkStatus::Pending)
            .collect();
        candidates.sort_by(|a, b| oldest_first(a, b));
        let ids: Vec<WorkItemId> = candidates.into_iter().take(max_count).map(|w| w.id).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = items.get_mut(&id) {
                item.mark_running(now)?;
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(
        &self,
        id: WorkItemId,
        outcome: &WorkOutcome,
    ) -> Result<WorkItem, QueueError> {
        let mut items = self.items.write().map_err(|_| Self::poisoned())?;
        let item = items.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        item.finish(outcome, Utc::now())?;
        Ok(item.clone())
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, QueueError> {
        let items = self.items.read().map_err(|_| Self::poisoned())?;
        Ok(items.get(&id).cloned())
    }

    async fn list_for_key(
        &self,
        job_type: JobType,
        entity_id: &str,
    ) -> Result<Vec<WorkItem>, QueueError> {
        let items = self.items.read().map_err(|_| Self::poisoned())?;
        let mut result: Vec<_> = items
            .values()
            .filter(|w| w.is_key(job_type, entity_id))
            .cloned()
            .collect();
        result.sort_by(oldest_first);
        Ok(result)
    }

    async fn requeue_errored(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItemId>, QueueError> {
        let mut items = self.items.write().map_err(|_| Self::poisoned())?;

        let mut due: Vec<&WorkItem> = items.values().filter(|w| policy.is_due(w, now)).collect();
        due.sort_by(|a, b| oldest_first(a, b));
        let due: Vec<WorkItemId> = due.into_iter().map(|w| w.id).collect();

        let mut requeued = Vec::new();
        for id in due {
            let Some(candidate) = items.get(&id) else {
                continue;
            };
            let (job_type, entity_id) = (candidate.job_type, candidate.entity_id.clone());
            let key_busy = items
                .values()
                .any(|w| w.status.is_active() && w.is_key(job_type, &entity_id));
            if key_busy {
                continue;
            }
            if let Some(item) = items.get_mut(&id) {
                item.mark_requeued(now)?;
                requeued.push(id);
            }
        }
        Ok(requeued)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let items = self.items.read().map_err(|_| Self::poisoned())?;
        let mut stats = QueueStats::default();
        for item in items.values() {
            stats.record(item.status);
        }
        Ok(stats)
    }
}
