use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use questlog_core::{HolderToken, Lease};

use super::store::{LeaseStore, LeaseStoreError};

/// In-memory lease table.
///
/// Intended for tests/dev and single-process deployments. The map key plays
/// the role of the `job_name` primary key.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: RwLock<HashMap<String, Lease>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> LeaseStoreError {
        LeaseStoreError::Storage("lease table lock poisoned".to_string())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, LeaseStoreError> {
        let mut leases = self.leases.write().map_err(|_| Self::poisoned())?;
        let before = leases.len();
        leases.retain(|_, lease| !lease.is_expired_at(now));
        Ok((before - leases.len()) as u64)
    }

    async fn insert(&self, lease: &Lease) -> Result<(), LeaseStoreError> {
        let mut leases = self.leases.write().map_err(|_| Self::poisoned())?;
        if leases.contains_key(&lease.job_name) {
            return Err(LeaseStoreError::AlreadyHeld(lease.job_name.clone()));
        }
        leases.insert(lease.job_name.clone(), lease.clone());
        Ok(())
    }

    async fn delete_held(
        &self,
        job_name: &str,
        holder_token: HolderToken,
    ) -> Result<bool, LeaseStoreError> {
        let mut leases = self.leases.write().map_err(|_| Self::poisoned())?;
        match leases.get(job_name) {
            Some(lease) if lease.holder_token == holder_token => {
                leases.remove(job_name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_any(&self, job_name: &str) -> Result<bool, LeaseStoreError> {
        let mut leases = self.leases.write().map_err(|_| Self::poisoned())?;
        Ok(leases.remove(job_name).is_some())
    }

    async fn extend(
        &self,
        job_name: &str,
        holder_token: HolderToken,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaseStoreError> {
        let mut leases = self.leases.write().map_err(|_| Self::poisoned())?;
        match leases.get_mut(job_name) {
            Some(lease) if lease.holder_token == holder_token && !lease.is_expired_at(now) => {
                lease.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, job_name: &str) -> Result<Option<Lease>, LeaseStoreError> {
        let leases = self.leases.read().map_err(|_| Self::poisoned())?;
        Ok(leases.get(job_name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn lease(name: &str, ttl_secs: u64, now: DateTime<Utc>) -> Lease {
        Lease::issue(name, Duration::from_secs(ttl_secs), now).unwrap()
    }

    #[tokio::test]
    async fn second_insert_for_same_name_conflicts() {
        let store = InMemoryLeaseStore::new();
        let now = Utc::now();

        store.insert(&lease("job-x", 60, now)).await.unwrap();
        let err = store.insert(&lease("job-x", 60, now)).await.unwrap_err();
        assert!(matches!(err, LeaseStoreError::AlreadyHeld(name) if name == "job-x"));

        // Different name is independent.
        store.insert(&lease("job-y", 60, now)).await.unwrap();
    }

    #[tokio::test]
    async fn delete_expired_only_removes_expired_rows() {
        let store = InMemoryLeaseStore::new();
        let now = Utc::now();
        store.insert(&lease("old", 1, now - chrono::Duration::seconds(5))).await.unwrap();
        store.insert(&lease("fresh", 60, now)).await.unwrap();

        assert_eq!(store.delete_expired(now).await.unwrap(), 1);
        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.get("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_held_checks_the_token() {
        let store = InMemoryLeaseStore::new();
        let held = lease("job-x", 60, Utc::now());
        store.insert(&held).await.unwrap();

        assert!(!store.delete_held("job-x", HolderToken::new()).await.unwrap());
        assert!(store.get("job-x").await.unwrap().is_some());

        assert!(store.delete_held("job-x", held.holder_token).await.unwrap());
        assert!(store.get("job-x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn extend_requires_live_lease_and_matching_token() {
        let store = InMemoryLeaseStore::new();
        let now = Utc::now();
        let held = lease("job-x", 10, now);
        store.insert(&held).await.unwrap();

        let later = now + chrono::Duration::minutes(5);
        assert!(!store.extend("job-x", HolderToken::new(), later, now).await.unwrap());
        assert!(store.extend("job-x", held.holder_token, later, now).await.unwrap());
        assert_eq!(store.get("job-x").await.unwrap().unwrap().expires_at, later);

        // Past its expiry the holder can no longer extend.
        let after_expiry = later + chrono::Duration::seconds(1);
        assert!(!store
            .extend("job-x", held.holder_token, after_expiry + chrono::Duration::minutes(1), after_expiry)
            .await
            .unwrap());
    }
}
