//! Infrastructure layer: lease lock, work queue, DB, Redis, config, external services.

pub mod config;
pub mod coordination;
pub mod db;
pub mod external;
pub mod lease;
pub mod queue;

pub use config::{ConfigError, CoordinationConfig, LeaseBackend, PersistentConfig};
pub use coordination::{Coordination, CoordinationError};
pub use lease::{LeaseLock, LeaseStore, LockError, LockOutcome};
pub use queue::{QueueError, QueueWorker, RetryPolicy, WorkQueueStore};
