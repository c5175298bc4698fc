//! `questlog-core`: coordination building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! leases for single-flight scheduled tasks and work items for the idempotent
//! background queue.

pub mod error;
pub mod id;
pub mod lease;
pub mod work;

pub use error::{DomainError, DomainResult};
pub use id::{HolderToken, WorkItemId};
pub use lease::{DEFAULT_LEASE_DURATION, Lease, lease_expiry, validate_job_name};
pub use work::{JobType, WorkItem, WorkOutcome, WorkStatus, validate_entity_id};
