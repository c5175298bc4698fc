//! Postgres-backed work queue (`work_items` table).
//!
//! - **Enqueue**: `INSERT .. ON CONFLICT DO NOTHING` against the partial unique
//!   index `work_items_active_key`; no row back means an active row exists and
//!   its id is returned instead
//! - **Claim**: `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP LOCKED)`, so
//!   concurrent claimers never see the same row
//! - **Complete**: conditional on `status = 'running'`

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use questlog_core::{JobType, WorkItem, WorkItemId, WorkOutcome, WorkStatus, validate_entity_id};

use super::store::WorkQueueStore;
use super::types::{EnqueueReceipt, QueueError, QueueStats, RetryPolicy};
use crate::db::{describe_sqlx_error, is_unique_violation};

/// How often `enqueue` retries when the active row it conflicted with finished
/// before it could be read back.
const ENQUEUE_ATTEMPTS: usize = 3;

const ITEM_COLUMNS: &str =
    "id, job_type, entity_id, status, attempts, last_error, created_at, updated_at";

/// Postgres work queue store.
#[derive(Debug, Clone)]
pub struct PostgresWorkQueueStore {
    pool: Arc<PgPool>,
}

impl PostgresWorkQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn find_active(
        &self,
        job_type: JobType,
        entity_id: &str,
    ) -> Result<Option<WorkItemId>, QueueError> {
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM work_items
            WHERE job_type = $1 AND entity_id = $2 AND status IN ('pending', 'running')
            "#,
        )
        .bind(job_type.as_str())
        .bind(entity_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_active", e))?;
        Ok(id.map(WorkItemId::from_uuid))
    }
}

#[async_trait]
impl WorkQueueStore for PostgresWorkQueueStore {
    #[instrument(skip(self), err)]
    async fn enqueue(
        &self,
        job_type: JobType,
        entity_id: &str,
    ) -> Result<EnqueueReceipt, QueueError> {
        validate_entity_id(entity_id)?;

        for attempt in 1..=ENQUEUE_ATTEMPTS {
            let item = WorkItem::new(job_type, entity_id, Utc::now())?;
            let inserted: Option<Uuid> = sqlx::query_scalar(
                r#"
                INSERT INTO work_items
                    (id, job_type, entity_id, status, attempts, last_error, created_at, updated_at)
                VALUES ($1, $2, $3, 'pending', 0, NULL, $4, $4)
                ON CONFLICT (job_type, entity_id) WHERE status IN ('pending', 'running')
                DO NOTHING
                RETURNING id
                "#,
            )
            .bind(item.id.as_uuid())
            .bind(job_type.as_str())
            .bind(entity_id)
            .bind(item.created_at)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;

            if let Some(id) = inserted {
                return Ok(EnqueueReceipt {
                    id: WorkItemId::from_uuid(id),
                    created: true,
                });
            }
            if let Some(id) = self.find_active(job_type, entity_id).await? {
                return Ok(EnqueueReceipt { id, created: false });
            }
            // The conflicting row finished between the insert and the lookup.
            debug!(%job_type, entity_id, attempt, "active row vanished; retrying enqueue");
        }

        warn!(%job_type, entity_id, "enqueue gave up after repeated collisions");
        Err(QueueError::Contended {
            job_type: job_type.to_string(),
            entity_id: entity_id.to_string(),
        })
    }

    #[instrument(skip(self), err)]
    async fn claim_batch(&self, max_count: usize) -> Result<Vec<WorkItem>, QueueError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(max_count).unwrap_or(i64::MAX);

        let rows = sqlx::query(&format!(
            r#"
            UPDATE work_items
            SET status = 'running', attempts = attempts + 1, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM work_items
                WHERE status = 'pending'
                ORDER BY created_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT $1
            )
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        // RETURNING carries no order.
        let mut items = rows_to_items(&rows)?;
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    #[instrument(skip(self, outcome), fields(status = %outcome.status()), err)]
    async fn complete(
        &self,
        id: WorkItemId,
        outcome: &WorkOutcome,
    ) -> Result<WorkItem, QueueError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE work_items
            SET status = $2, last_error = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(outcome.status().as_str())
        .bind(outcome.error_message())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if let Some(row) = row {
            return row_to_item(&row);
        }

        match self.get(id).await? {
            Some(current) => Err(QueueError::InvalidTransition(format!(
                "cannot complete work item {id} in status {}",
                current.status
            ))),
            None => Err(QueueError::NotFound(id)),
        }
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, QueueError> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_work_item", e))?;

        row.as_ref().map(row_to_item).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_for_key(
        &self,
        job_type: JobType,
        entity_id: &str,
    ) -> Result<Vec<WorkItem>, QueueError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ITEM_COLUMNS} FROM work_items
            WHERE job_type = $1 AND entity_id = $2
            ORDER BY created_at, id
            "#
        ))
        .bind(job_type.as_str())
        .bind(entity_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_for_key", e))?;

        rows_to_items(&rows)
    }

    #[instrument(skip(self, policy), err)]
    async fn requeue_errored(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItemId>, QueueError> {
        let max_attempts = i32::try_from(policy.max_attempts).unwrap_or(i32::MAX);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ITEM_COLUMNS} FROM work_items
            WHERE status = 'error' AND attempts < $1
            ORDER BY created_at, id
            "#
        ))
        .bind(max_attempts)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_candidates", e))?;

        let mut requeued = Vec::new();
        for item in rows_to_items(&rows)? {
            if !policy.is_due(&item, now) {
                continue;
            }
            let updated = sqlx::query(
                r#"
                UPDATE work_items
                SET status = 'pending', updated_at = $2
                WHERE id = $1 AND status = 'error'
                "#,
            )
            .bind(item.id.as_uuid())
            .bind(now)
            .execute(&*self.pool)
            .await;

            match updated {
                Ok(result) if result.rows_affected() > 0 => requeued.push(item.id),
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    debug!(id = %item.id, "key already has an active row; not requeued");
                }
                Err(e) => return Err(map_sqlx_error("requeue", e)),
            }
        }
        Ok(requeued)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM work_items GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let count = usize::try_from(count).unwrap_or(0);
            match status.parse::<WorkStatus>()? {
                WorkStatus::Pending => stats.pending += count,
                WorkStatus::Running => stats.running += count,
                WorkStatus::Done => stats.done += count,
                WorkStatus::Error => stats.error += count,
            }
        }
        Ok(stats)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    QueueError::Storage(describe_sqlx_error(operation, &err))
}

fn row_to_item(row: &sqlx::postgres::PgRow) -> Result<WorkItem, QueueError> {
    let raw = WorkItemRow::from_row(row)
        .map_err(|e| QueueError::Storage(format!("failed to deserialize work item row: {e}")))?;
    raw.try_into()
}

fn rows_to_items(rows: &[sqlx::postgres::PgRow]) -> Result<Vec<WorkItem>, QueueError> {
    rows.iter().map(row_to_item).collect()
}

#[derive(Debug)]
struct WorkItemRow {
    id: Uuid,
    job_type: String,
    entity_id: String,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for WorkItemRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            entity_id: row.try_get("entity_id")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = QueueError;

    fn try_from(row: WorkItemRow) -> Result<Self, Self::Error> {
        Ok(WorkItem {
            id: WorkItemId::from_uuid(row.id),
            job_type: row.job_type.parse()?,
            entity_id: row.entity_id,
            status: row.status.parse()?,
            attempts: u32::try_from(row.attempts).map_err(|_| {
                QueueError::Storage(format!("negative attempts on work item {}", row.id))
            })?,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
