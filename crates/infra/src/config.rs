//! Configuration loading and representation.
//!
//! Everything comes from environment variables:
//!
//! | variable | default |
//! |----------|---------|
//! | `USE_PERSISTENT_STORES` | `false` |
//! | `DATABASE_URL` | required when persistent |
//! | `LEASE_BACKEND` | `postgres` (`redis` needs the `redis` feature) |
//! | `REDIS_URL` | `redis://localhost:6379` |
//! | `LEASE_TTL_SECS` | `600` |
//! | `WORK_BATCH_SIZE` | `10` |
//! | `DB_MAX_CONNECTIONS` | `5` |

use core::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use questlog_core::{DEFAULT_LEASE_DURATION, lease_expiry};

use crate::queue::DEFAULT_BATCH_SIZE;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Where leases live when persistent stores are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaseBackend {
    #[default]
    Postgres,
    Redis,
}

impl FromStr for LeaseBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(LeaseBackend::Postgres),
            "redis" => Ok(LeaseBackend::Redis),
            other => Err(format!("unknown lease backend `{other}`")),
        }
    }
}

/// Connection settings for the persistent backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub lease_backend: LeaseBackend,
    pub redis_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationConfig {
    /// `None` means in-memory stores (dev/test, single process).
    pub persistent: Option<PersistentConfig>,
    pub lease_ttl: Duration,
    pub batch_size: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            persistent: None,
            lease_ttl: DEFAULT_LEASE_DURATION,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl CoordinationConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let use_persistent: bool = parse_or(&get, "USE_PERSISTENT_STORES", false)?;
        let lease_ttl_secs: u64 = parse_or(&get, "LEASE_TTL_SECS", DEFAULT_LEASE_DURATION.as_secs())?;
        if lease_ttl_secs == 0 {
            return Err(invalid("LEASE_TTL_SECS", "0", "must be greater than zero"));
        }
        let lease_ttl = Duration::from_secs(lease_ttl_secs);
        if let Err(e) = lease_expiry(Utc::now(), lease_ttl) {
            return Err(invalid("LEASE_TTL_SECS", &lease_ttl_secs.to_string(), e.to_string()));
        }
        let batch_size: usize = parse_or(&get, "WORK_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(invalid("WORK_BATCH_SIZE", "0", "must be greater than zero"));
        }

        let persistent = if use_persistent {
            let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
            let max_connections = parse_or(&get, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?;
            if max_connections == 0 {
                return Err(invalid("DB_MAX_CONNECTIONS", "0", "must be greater than zero"));
            }
            Some(PersistentConfig {
                database_url,
                max_connections,
                lease_backend: parse_or(&get, "LEASE_BACKEND", LeaseBackend::default())?,
                redis_url: get("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            })
        } else {
            None
        };

        Ok(Self {
            persistent,
            lease_ttl,
            batch_size,
        })
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &raw, e.to_string())),
    }
}
