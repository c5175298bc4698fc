//! Redis-backed lease store.
//!
//! Each lease is one key, `questlog:lease:<job_name>`, holding the JSON-encoded
//! [`Lease`] with a `PX` expiry equal to the lease duration:
//!
//! - **Acquire**: `SET key value NX PX ttl` (nil reply = already held)
//! - **Expiry**: Redis evicts the key itself, so `delete_expired` has nothing to do
//! - **Token-checked release / extend**: Lua scripts compare `holder_token`
//!   atomically before touching the key

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use tracing::instrument;

use questlog_core::{HolderToken, Lease};

use super::store::{LeaseStore, LeaseStoreError};

/// Default key prefix for lease keys.
const DEFAULT_KEY_PREFIX: &str = "questlog:lease:";

const DELETE_HELD_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local lease = cjson.decode(raw)
if lease['holder_token'] == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const EXTEND_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local lease = cjson.decode(raw)
if lease['holder_token'] ~= ARGV[1] then return 0 end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

#[derive(Debug, Clone)]
pub struct RedisLeaseStore {
    client: Arc<redis::Client>,
    key_prefix: String,
}

impl RedisLeaseStore {
    /// Create a store for `redis_url` (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LeaseStoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LeaseStoreError::Storage(format!("redis connection error: {e}")))?;
        Ok(Self {
            client: Arc::new(client),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, job_name: &str) -> String {
        format!("{}{}", self.key_prefix, job_name)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, LeaseStoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LeaseStoreError::Storage(format!("redis connection error: {e}")))
    }
}

fn command_error(operation: &str, err: redis::RedisError) -> LeaseStoreError {
    LeaseStoreError::Storage(format!("redis error in {operation}: {err}"))
}

fn encode(lease: &Lease) -> Result<String, LeaseStoreError> {
    serde_json::to_string(lease)
        .map_err(|e| LeaseStoreError::Storage(format!("lease serialization error: {e}")))
}

/// Milliseconds until `expires_at`, at least 1 so `PX` stays valid.
fn ttl_millis(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expires_at - now).num_milliseconds().max(1)
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn delete_expired(&self, _now: DateTime<Utc>) -> Result<u64, LeaseStoreError> {
        // Keys carry their own PX expiry.
        Ok(0)
    }

    #[instrument(skip(self, lease), fields(job_name = %lease.job_name), err)]
    async fn insert(&self, lease: &Lease) -> Result<(), LeaseStoreError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(&lease.job_name))
            .arg(encode(lease)?)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(lease.expires_at, lease.acquired_at))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("insert", e))?;

        match reply {
            Some(_) => Ok(()),
            None => Err(LeaseStoreError::AlreadyHeld(lease.job_name.clone())),
        }
    }

    #[instrument(skip(self), err)]
    async fn delete_held(
        &self,
        job_name: &str,
        holder_token: HolderToken,
    ) -> Result<bool, LeaseStoreError> {
        let mut conn = self.connection().await?;
        let deleted: i64 = redis::Script::new(DELETE_HELD_SCRIPT)
            .key(self.key(job_name))
            .arg(holder_token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("delete_held", e))?;
        Ok(deleted > 0)
    }

    #[instrument(skip(self), err)]
    async fn delete_any(&self, job_name: &str) -> Result<bool, LeaseStoreError> {
        let mut conn = self.connection().await?;
        let deleted: i64 = conn
            .del(self.key(job_name))
            .await
            .map_err(|e| command_error("delete_any", e))?;
        Ok(deleted > 0)
    }

    #[instrument(skip(self), err)]
    async fn extend(
        &self,
        job_name: &str,
        holder_token: HolderToken,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaseStoreError> {
        let Some(current) = self.get(job_name).await? else {
            return Ok(false);
        };
        if current.holder_token != holder_token || current.is_expired_at(now) {
            return Ok(false);
        }
        let extended = Lease {
            expires_at,
            ..current
        };

        let mut conn = self.connection().await?;
        let updated: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(self.key(job_name))
            .arg(holder_token.to_string())
            .arg(encode(&extended)?)
            .arg(ttl_millis(expires_at, now))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("extend", e))?;
        Ok(updated > 0)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_name: &str) -> Result<Option<Lease>, LeaseStoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(self.key(job_name))
            .await
            .map_err(|e| command_error("get", e))?;

        raw.map(|raw| {
            serde_json::from_str::<Lease>(&raw)
                .map_err(|e| LeaseStoreError::Storage(format!("lease deserialization error: {e}")))
        })
        .transpose()
    }
}
