//! Single-flight execution of named recurring jobs.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, info, warn};

use questlog_core::{DEFAULT_LEASE_DURATION, DomainError, Lease};

use super::store::{LeaseStore, LeaseStoreError};

/// Why an acquisition attempt failed (as opposed to finding the lease held).
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] LeaseStoreError),
}

/// Result of [`LeaseLock::with_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// The lease was acquired and the closure ran to completion.
    Ran(T),
    /// Someone else holds the lease (or the store was unreachable); nothing ran.
    Skipped,
}

impl<T> LockOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, LockOutcome::Skipped)
    }

    /// `true` when the closure ran.
    pub fn success(&self) -> bool {
        !self.is_skipped()
    }

    pub fn into_inner(self) -> Option<T> {
        match self {
            LockOutcome::Ran(value) => Some(value),
            LockOutcome::Skipped => None,
        }
    }
}

/// Lease-based mutual exclusion over a [`LeaseStore`].
///
/// Every attempt is a single round of "delete expired rows, insert ours";
/// there is no waiting or retrying. A caller that does not get the lease
/// should skip its run.
#[derive(Debug, Clone)]
pub struct LeaseLock<S> {
    store: S,
    default_ttl: Duration,
}

impl<S: LeaseStore> LeaseLock<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            default_ttl: DEFAULT_LEASE_DURATION,
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Lease duration configured for callers without their own estimate.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Try to take the lease for `job_name`.
    ///
    /// `Ok(None)` means another holder is active; `Err` means the attempt
    /// itself failed and nothing is known about the lease.
    pub async fn try_acquire(
        &self,
        job_name: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, LockError> {
        let now = Utc::now();
        let lease = Lease::issue(job_name, ttl, now)?;

        let reclaimed = self.store.delete_expired(now).await?;
        if reclaimed > 0 {
            debug!(reclaimed, "removed expired leases");
        }

        match self.store.insert(&lease).await {
            Ok(()) => {
                info!(
                    job_name,
                    holder = %lease.holder_token,
                    expires_at = %lease.expires_at,
                    "lease acquired"
                );
                Ok(Some(lease))
            }
            Err(LeaseStoreError::AlreadyHeld(_)) => {
                debug!(job_name, "lease held elsewhere");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take the lease for `job_name`, or `None`.
    ///
    /// Fail-closed: a store or validation failure is logged and reported as
    /// not acquired, exactly like contention.
    pub async fn acquire(&self, job_name: &str, ttl: Duration) -> Option<Lease> {
        match self.try_acquire(job_name, ttl).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(job_name, error = %e, "lease acquisition failed; treating as held");
                None
            }
        }
    }

    /// Give the lease back, only if it is still ours.
    ///
    /// Best-effort: failures are logged and the lease is left to expire.
    pub async fn release(&self, lease: &Lease) -> bool {
        match self
            .store
            .delete_held(&lease.job_name, lease.holder_token)
            .await
        {
            Ok(true) => {
                debug!(job_name = %lease.job_name, "lease released");
                true
            }
            Ok(false) => {
                warn!(
                    job_name = %lease.job_name,
                    holder = %lease.holder_token,
                    "lease was no longer ours at release"
                );
                false
            }
            Err(e) => {
                warn!(job_name = %lease.job_name, error = %e, "lease release failed; it will expire");
                false
            }
        }
    }

    /// Delete the lease for `job_name` whoever holds it.
    ///
    /// For operators clearing a stuck job; scheduled code should use [`release`](Self::release).
    pub async fn force_release(&self, job_name: &str) -> bool {
        match self.store.delete_any(job_name).await {
            Ok(removed) => {
                info!(job_name, removed, "lease force-released");
                removed
            }
            Err(e) => {
                warn!(job_name, error = %e, "forced lease release failed");
                false
            }
        }
    }

    /// Push the expiry of a lease we still hold to `now + ttl`.
    pub async fn extend(&self, lease: &Lease, ttl: Duration) -> Option<Lease> {
        let now = Utc::now();
        let extended = match lease.extended(ttl, now) {
            Ok(extended) => extended,
            Err(e) => {
                warn!(job_name = %lease.job_name, error = %e, "invalid lease extension");
                return None;
            }
        };

        match self
            .store
            .extend(&lease.job_name, lease.holder_token, extended.expires_at, now)
            .await
        {
            Ok(true) => {
                debug!(
                    job_name = %lease.job_name,
                    remaining_secs = extended.remaining_at(now).as_secs(),
                    "lease extended"
                );
                Some(extended)
            }
            Ok(false) => None,
            Err(e) => {
                warn!(job_name = %lease.job_name, error = %e, "lease extension failed");
                None
            }
        }
    }

    /// Current unexpired holder of `job_name`, if any.
    pub async fn holder(&self, job_name: &str) -> Result<Option<Lease>, LockError> {
        let now = Utc::now();
        let holder = self
            .store
            .get(job_name)
            .await?
            .filter(|lease| !lease.is_expired_at(now));
        if let Some(lease) = &holder {
            debug!(
                job_name,
                holder = %lease.holder_token,
                remaining_secs = lease.remaining_at(now).as_secs(),
                "lease is held"
            );
        }
        Ok(holder)
    }

    /// Run `f` while holding the lease for `job_name`.
    ///
    /// - lease not acquired: `f` is not called, `Ok(LockOutcome::Skipped)`
    /// - `f` returns `Ok(v)`: `Ok(LockOutcome::Ran(v))`
    /// - `f` returns `Err(e)`: `Err(e)`
    /// - `f` panics: the panic resumes
    ///
    /// The lease is released before returning in all three cases where `f` ran.
    pub async fn with_lock<F, Fut, T, E>(
        &self,
        job_name: &str,
        ttl: Duration,
        f: F,
    ) -> Result<LockOutcome<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(lease) = self.acquire(job_name, ttl).await else {
            info!(job_name, "skipping run; lease not acquired");
            return Ok(LockOutcome::Skipped);
        };

        let result = AssertUnwindSafe(f()).catch_unwind().await;
        self.release(&lease).await;

        match result {
            Ok(Ok(value)) => Ok(LockOutcome::Ran(value)),
            Ok(Err(e)) => Err(e),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::DateTime;
    use questlog_core::HolderToken;

    use super::*;
    use crate::lease::InMemoryLeaseStore;

    fn lock() -> LeaseLock<Arc<InMemoryLeaseStore>> {
        LeaseLock::new(InMemoryLeaseStore::arc())
    }

    /// Store whose every call fails, as if the database were unreachable.
    struct UnreachableStore;

    #[async_trait]
    impl LeaseStore for UnreachableStore {
        async fn delete_expired(&self, _now: DateTime<Utc>) -> Result<u64, LeaseStoreError> {
            Err(LeaseStoreError::Storage("connection refused".into()))
        }
        async fn insert(&self, _lease: &Lease) -> Result<(), LeaseStoreError> {
            Err(LeaseStoreError::Storage("connection refused".into()))
        }
        async fn delete_held(&self, _: &str, _: HolderToken) -> Result<bool, LeaseStoreError> {
            Err(LeaseStoreError::Storage("connection refused".into()))
        }
        async fn delete_any(&self, _: &str) -> Result<bool, LeaseStoreError> {
            Err(LeaseStoreError::Storage("connection refused".into()))
        }
        async fn extend(
            &self,
            _: &str,
            _: HolderToken,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<bool, LeaseStoreError> {
            Err(LeaseStoreError::Storage("connection refused".into()))
        }
        async fn get(&self, _: &str) -> Result<Option<Lease>, LeaseStoreError> {
            Err(LeaseStoreError::Storage("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let lock = lock();
        let ttl = Duration::from_secs(60);

        let lease = lock.acquire("job-x", ttl).await.unwrap();
        assert!(lock.acquire("job-x", ttl).await.is_none());

        assert!(lock.release(&lease).await);
        assert!(lock.acquire("job-x", ttl).await.is_some());
    }

    #[tokio::test]
    async fn store_failure_is_fail_closed() {
        let lock = LeaseLock::new(UnreachableStore);
        assert!(lock.acquire("job-x", Duration::from_secs(60)).await.is_none());
        assert!(matches!(
            lock.try_acquire("job-x", Duration::from_secs(60)).await,
            Err(LockError::Store(_))
        ));

        let calls = AtomicUsize::new(0);
        let outcome = lock
            .with_lock("job-x", Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::convert::Infallible>(())
            })
            .await
            .unwrap();
        assert!(outcome.is_skipped());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_input_is_not_acquired() {
        let lock = lock();
        assert!(lock.acquire("", Duration::from_secs(60)).await.is_none());
        assert!(matches!(
            lock.try_acquire("job-x", Duration::ZERO).await,
            Err(LockError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn oversized_ttl_is_not_acquired() {
        let lock = lock();
        let huge = Duration::from_secs(100_000_000_000_000);

        assert!(lock.acquire("job-x", huge).await.is_none());
        assert!(matches!(
            lock.try_acquire("job-x", huge).await,
            Err(LockError::Invalid(_))
        ));

        let outcome = lock
            .with_lock("job-x", huge, || async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap();
        assert!(outcome.is_skipped());

        let lease = lock.acquire("job-x", Duration::from_secs(60)).await.unwrap();
        assert!(lock.extend(&lease, huge).await.is_none());
        assert!(lock.release(&lease).await);
    }

    #[tokio::test]
    async fn stale_holder_cannot_release_new_holders_lease() {
        let lock = lock();
        let store = lock.store().clone();
        let now = Utc::now();

        // Holder A's lease already expired.
        let stale = Lease {
            expires_at: now - chrono::Duration::seconds(1),
            ..Lease::issue("job-x", Duration::from_secs(1), now).unwrap()
        };
        store.insert(&stale).await.unwrap();

        // Holder B reclaims it.
        let fresh = lock.acquire("job-x", Duration::from_secs(60)).await.unwrap();

        // A finishes late and releases: B keeps the lease.
        assert!(!lock.release(&stale).await);
        let holder = lock.holder("job-x").await.unwrap().unwrap();
        assert_eq!(holder.holder_token, fresh.holder_token);
    }

    #[tokio::test]
    async fn force_release_ignores_ownership() {
        let lock = lock();
        lock.acquire("job-x", Duration::from_secs(60)).await.unwrap();

        assert!(lock.force_release("job-x").await);
        assert!(!lock.force_release("job-x").await);
        assert!(lock.holder("job-x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn extend_keeps_the_lease_alive() {
        let lock = lock();
        let lease = lock.acquire("job-x", Duration::from_secs(1)).await.unwrap();

        let extended = lock.extend(&lease, Duration::from_secs(600)).await.unwrap();
        assert!(extended.expires_at > lease.expires_at);
        assert_eq!(extended.holder_token, lease.holder_token);

        lock.force_release("job-x").await;
        assert!(lock.extend(&lease, Duration::from_secs(600)).await.is_none());
    }

    #[tokio::test]
    async fn with_lock_returns_closure_value() {
        let lock = lock();
        let outcome = lock
            .with_lock("job-x", Duration::from_secs(60), || async {
                Ok::<_, anyhow::Error>(42)
            })
            .await
            .unwrap();

        assert_eq!(outcome, LockOutcome::Ran(42));
        assert!(outcome.success());
        assert!(lock.holder("job-x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn with_lock_releases_when_closure_panics() {
        let lock = lock();

        async fn explode() -> anyhow::Result<()> {
            panic!("task blew up")
        }

        let result = AssertUnwindSafe(lock.with_lock("job-x", Duration::from_secs(60), explode))
            .catch_unwind()
            .await;

        assert!(result.is_err());
        assert!(lock.holder("job-x").await.unwrap().is_none());
        assert!(lock.acquire("job-x", Duration::from_secs(60)).await.is_some());
    }
}
