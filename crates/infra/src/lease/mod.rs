//! Lease-based mutual exclusion for scheduled jobs.
//!
//! ## Design
//!
//! - One lease row per job name; the store's uniqueness on the name is the lock
//! - Expired rows are removed by the next acquisition attempt (no reaper)
//! - Acquisition is a single attempt and fails closed on store errors
//! - Release is token-checked; `force_release` exists for operators
//!
//! ## Components
//!
//! - `LeaseStore`: row operations (in-memory, Postgres, Redis behind `redis`)
//! - `LeaseLock`: `acquire` / `release` / `with_lock` on top of a store

pub mod in_memory;
pub mod lock;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;

pub use in_memory::InMemoryLeaseStore;
pub use lock::{LeaseLock, LockError, LockOutcome};
pub use postgres::PostgresLeaseStore;
#[cfg(feature = "redis")]
pub use redis::RedisLeaseStore;
pub use store::{LeaseStore, LeaseStoreError};
