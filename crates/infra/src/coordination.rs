//! Store wiring: builds the lease lock and work queue selected by configuration.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{ConfigError, CoordinationConfig, LeaseBackend, PersistentConfig};
use crate::db;
use crate::lease::{InMemoryLeaseStore, LeaseLock, LeaseStore, LeaseStoreError, PostgresLeaseStore};
use crate::queue::{InMemoryWorkQueueStore, PostgresWorkQueueStore, QueueWorker, WorkQueueStore};

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    LeaseStore(#[from] LeaseStoreError),
}

/// Shared handles for request handlers: one lease lock, one work queue.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Coordination {
    lock: Arc<LeaseLock<Arc<dyn LeaseStore>>>,
    queue: Arc<dyn WorkQueueStore>,
    batch_size: usize,
}

impl Coordination {
    /// In-memory stores regardless of `config.persistent` (dev/test).
    pub fn in_memory(config: &CoordinationConfig) -> Self {
        let leases: Arc<dyn LeaseStore> = InMemoryLeaseStore::arc();
        let queue: Arc<dyn WorkQueueStore> = InMemoryWorkQueueStore::arc();
        Self::assemble(leases, queue, config)
    }

    /// Build from the environment (`CoordinationConfig::from_env`).
    pub async fn from_env() -> Result<Self, CoordinationError> {
        let config = CoordinationConfig::from_env()?;
        Self::from_config(&config).await
    }

    pub async fn from_config(config: &CoordinationConfig) -> Result<Self, CoordinationError> {
        let Some(persistent) = &config.persistent else {
            info!("using in-memory coordination stores");
            return Ok(Self::in_memory(config));
        };

        let pool = db::connect(&persistent.database_url, persistent.max_connections).await?;
        db::ensure_schema(&pool).await?;

        let leases = lease_store(persistent, pool.clone())?;
        let queue: Arc<dyn WorkQueueStore> = Arc::new(PostgresWorkQueueStore::new(pool));
        info!(lease_backend = ?persistent.lease_backend, "using persistent coordination stores");
        Ok(Self::assemble(leases, queue, config))
    }

    fn assemble(
        leases: Arc<dyn LeaseStore>,
        queue: Arc<dyn WorkQueueStore>,
        config: &CoordinationConfig,
    ) -> Self {
        Self {
            lock: Arc::new(LeaseLock::new(leases).with_default_ttl(config.lease_ttl)),
            queue,
            batch_size: config.batch_size,
        }
    }

    pub fn lock(&self) -> &LeaseLock<Arc<dyn LeaseStore>> {
        &self.lock
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueueStore> {
        &self.queue
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lock.default_ttl()
    }

    /// A worker over the shared queue with the configured batch size.
    pub fn worker(&self) -> QueueWorker<Arc<dyn WorkQueueStore>> {
        QueueWorker::new(self.queue.clone()).with_batch_size(self.batch_size)
    }
}

fn lease_store(
    persistent: &PersistentConfig,
    pool: sqlx::PgPool,
) -> Result<Arc<dyn LeaseStore>, CoordinationError> {
    match persistent.lease_backend {
        LeaseBackend::Postgres => Ok(Arc::new(PostgresLeaseStore::new(pool))),
        LeaseBackend::Redis => redis_lease_store(persistent, pool),
    }
}

#[cfg(feature = "redis")]
fn redis_lease_store(
    persistent: &PersistentConfig,
    _pool: sqlx::PgPool,
) -> Result<Arc<dyn LeaseStore>, CoordinationError> {
    Ok(Arc::new(crate::lease::RedisLeaseStore::new(&persistent.redis_url)?))
}

#[cfg(not(feature = "redis"))]
fn redis_lease_store(
    _persistent: &PersistentConfig,
    pool: sqlx::PgPool,
) -> Result<Arc<dyn LeaseStore>, CoordinationError> {
    tracing::warn!("LEASE_BACKEND=redis but redis feature not enabled, falling back to postgres");
    Ok(Arc::new(PostgresLeaseStore::new(pool)))
}
