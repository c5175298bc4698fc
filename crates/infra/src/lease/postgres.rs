//! Postgres-backed lease store (`cron_locks` table).
//!
//! `job_name` is the primary key, so two concurrent inserts for the same job
//! cannot both succeed: the loser gets SQLSTATE `23505`, mapped to
//! `LeaseStoreError::AlreadyHeld`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use questlog_core::{HolderToken, Lease};

use super::store::{LeaseStore, LeaseStoreError};
use crate::db::{describe_sqlx_error, is_unique_violation};

/// Postgres lease store.
///
/// Cheap to clone; shares the pool.
#[derive(Debug, Clone)]
pub struct PostgresLeaseStore {
    pool: Arc<PgPool>,
}

impl PostgresLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    #[instrument(skip(self), err)]
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, LeaseStoreError> {
        let result = sqlx::query("DELETE FROM cron_locks WHERE expires_at <= $1")
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_expired", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, lease), fields(job_name = %lease.job_name), err)]
    async fn insert(&self, lease: &Lease) -> Result<(), LeaseStoreError> {
        sqlx::query(
            r#"
            INSERT INTO cron_locks (job_name, holder_token, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&lease.job_name)
        .bind(lease.holder_token.to_string())
        .bind(lease.acquired_at)
        .bind(lease.expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                LeaseStoreError::AlreadyHeld(lease.job_name.clone())
            } else {
                map_sqlx_error("insert_lease", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_held(
        &self,
        job_name: &str,
        holder_token: HolderToken,
    ) -> Result<bool, LeaseStoreError> {
        let result =
            sqlx::query("DELETE FROM cron_locks WHERE job_name = $1 AND holder_token = $2")
                .bind(job_name)
                .bind(holder_token.to_string())
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("delete_held", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn delete_any(&self, job_name: &str) -> Result<bool, LeaseStoreError> {
        let result = sqlx::query("DELETE FROM cron_locks WHERE job_name = $1")
            .bind(job_name)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_any", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn extend(
        &self,
        job_name: &str,
        holder_token: HolderToken,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaseStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cron_locks
            SET expires_at = $3
            WHERE job_name = $1 AND holder_token = $2 AND expires_at > $4
            "#,
        )
        .bind(job_name)
        .bind(holder_token.to_string())
        .bind(expires_at)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("extend", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_name: &str) -> Result<Option<Lease>, LeaseStoreError> {
        let row = sqlx::query(
            r#"
            SELECT job_name, holder_token, acquired_at, expires_at
            FROM cron_locks
            WHERE job_name = $1
            "#,
        )
        .bind(job_name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_lease", e))?;

        match row {
            Some(row) => {
                let lease_row = LeaseRow::from_row(&row).map_err(|e| {
                    LeaseStoreError::Storage(format!("failed to deserialize lease row: {e}"))
                })?;
                Ok(Some(lease_row.try_into()?))
            }
            None => Ok(None),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LeaseStoreError {
    if is_unique_violation(&err) {
        return LeaseStoreError::AlreadyHeld(describe_sqlx_error(operation, &err));
    }
    LeaseStoreError::Storage(describe_sqlx_error(operation, &err))
}

#[derive(Debug)]
struct LeaseRow {
    job_name: String,
    holder_token: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for LeaseRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            job_name: row.try_get("job_name")?,
            holder_token: row.try_get("holder_token")?,
            acquired_at: row.try_get("acquired_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

impl TryFrom<LeaseRow> for Lease {
    type Error = LeaseStoreError;

    fn try_from(row: LeaseRow) -> Result<Self, Self::Error> {
        let holder_token = row
            .holder_token
            .parse::<HolderToken>()
            .map_err(|e| LeaseStoreError::Storage(e.to_string()))?;
        Ok(Lease {
            job_name: row.job_name,
            holder_token,
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
        })
    }
}
