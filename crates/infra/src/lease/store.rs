//! Lease store contract.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use questlog_core::{HolderToken, Lease};

/// Row-level operations the lease lock needs from its backing store.
///
/// Implementations must reject a second insert for a `job_name` that already
/// has a row (`LeaseStoreError::AlreadyHeld`); that uniqueness is the whole
/// mutual-exclusion guarantee.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Delete every lease whose `expires_at <= now`. Returns how many were removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, LeaseStoreError>;

    /// Insert a new lease row, failing with `AlreadyHeld` if one exists for the name.
    async fn insert(&self, lease: &Lease) -> Result<(), LeaseStoreError>;

    /// Delete the row for `job_name` only if it is held by `holder_token`.
    async fn delete_held(
        &self,
        job_name: &str,
        holder_token: HolderToken,
    ) -> Result<bool, LeaseStoreError>;

    /// Delete the row for `job_name` whoever holds it.
    async fn delete_any(&self, job_name: &str) -> Result<bool, LeaseStoreError>;

    /// Move `expires_at` of an unexpired lease still held by `holder_token`.
    async fn extend(
        &self,
        job_name: &str,
        holder_token: HolderToken,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaseStoreError>;

    /// Current row for `job_name`, expired or not.
    async fn get(&self, job_name: &str) -> Result<Option<Lease>, LeaseStoreError>;
}

/// Lease store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaseStoreError {
    #[error("lease already held: {0}")]
    AlreadyHeld(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
impl<S: LeaseStore + ?Sized> LeaseStore for Arc<S> {
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, LeaseStoreError> {
        (**self).delete_expired(now).await
    }

    async fn insert(&self, lease: &Lease) -> Result<(), LeaseStoreError> {
        (**self).insert(lease).await
    }

    async fn delete_held(
        &self,
        job_name: &str,
        holder_token: HolderToken,
    ) -> Result<bool, LeaseStoreError> {
        (**self).delete_held(job_name, holder_token).await
    }

    async fn delete_any(&self, job_name: &str) -> Result<bool, LeaseStoreError> {
        (**self).delete_any(job_name).await
    }

    async fn extend(
        &self,
        job_name: &str,
        holder_token: HolderToken,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaseStoreError> {
        (**self).extend(job_name, holder_token, expires_at, now).await
    }

    async fn get(&self, job_name: &str) -> Result<Option<Lease>, LeaseStoreError> {
        (**self).get(job_name).await
    }
}
