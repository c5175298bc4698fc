//! Postgres wiring: connection pool, schema bootstrap and sqlx error helpers.
//!
//! ## Tables
//!
//! | table | key | purpose |
//! |-------|-----|---------|
//! | `cron_locks` | `job_name` (primary key) | one lease row per scheduled job |
//! | `work_items` | `id`, plus a partial unique index on `(job_type, entity_id)` over active rows | idempotent work queue |
//!
//! The partial unique index is what makes `enqueue` atomic: two concurrent
//! inserts for the same key cannot both leave an active row behind.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | Meaning |
//! |------------|----------------------|---------|
//! | Database (unique violation) | `23505` | Contention: lease already held / active row already exists |
//! | Database (check constraint violation) | `23514` | Invalid status or data |
//! | Anything else | N/A | Storage failure (treated as "could not acquire" by the lock) |

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, instrument};

/// DDL for the coordination tables. Every statement is idempotent.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS cron_locks (
        job_name     TEXT PRIMARY KEY,
        holder_token TEXT NOT NULL,
        acquired_at  TIMESTAMPTZ NOT NULL,
        expires_at   TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS work_items (
        id         UUID PRIMARY KEY,
        job_type   TEXT NOT NULL,
        entity_id  TEXT NOT NULL,
        status     TEXT NOT NULL CHECK (status IN ('pending', 'running', 'done', 'error')),
        attempts   INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS work_items_active_key
        ON work_items (job_type, entity_id)
        WHERE status IN ('pending', 'running')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS work_items_pending_fifo
        ON work_items (created_at, id)
        WHERE status = 'pending'
    "#,
];

/// Open a Postgres pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Create the coordination tables and indexes if they do not exist yet.
#[instrument(skip(pool), err)]
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(*statement).execute(pool).await?;
    }
    info!(statements = SCHEMA.len(), "coordination schema ready");
    Ok(())
}

/// Check if an error is a unique constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

/// Render an sqlx error with the operation it happened in.
pub fn describe_sqlx_error(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "?".to_string());
            format!("database error in {operation} ({code}): {}", db_err.message())
        }
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        sqlx::Error::PoolTimedOut => format!("connection pool timed out in {operation}"),
        sqlx::Error::RowNotFound => format!("unexpected row not found in {operation}"),
        other => format!("sqlx error in {operation}: {other}"),
    }
}
