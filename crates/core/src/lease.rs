//! Lease value type: a time-bounded exclusive claim on a named job.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::HolderToken;

/// Lease duration used when the caller has no better estimate of the run time.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(10 * 60);

/// One held lease (one row per `job_name` in the store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_name: String,
    pub holder_token: HolderToken,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Mint a lease for `job_name` starting at `now`.
    ///
    /// Fails on an empty job name, a zero duration, or an expiry past the
    /// representable range.
    pub fn issue(job_name: &str, ttl: Duration, now: DateTime<Utc>) -> DomainResult<Self> {
        validate_job_name(job_name)?;
        Ok(Self {
            job_name: job_name.to_string(),
            holder_token: HolderToken::new(),
            acquired_at: now,
            expires_at: lease_expiry(now, ttl)?,
        })
    }

    /// A lease is invalid once `now >= expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, zero if already expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Same holder, new expiry of `now + ttl`.
    pub fn extended(&self, ttl: Duration, now: DateTime<Utc>) -> DomainResult<Self> {
        Ok(Self {
            expires_at: lease_expiry(now, ttl)?,
            ..self.clone()
        })
    }
}

/// Job names key the lease table and must be non-empty.
pub fn validate_job_name(job_name: &str) -> DomainResult<()> {
    if job_name.trim().is_empty() {
        return Err(DomainError::validation("job name must not be empty"));
    }
    Ok(())
}

/// Expiry of a lease of `ttl` starting at `now`.
pub fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DomainResult<DateTime<Utc>> {
    if ttl.is_zero() {
        return Err(DomainError::validation("lease duration must be positive"));
    }
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|span| now.checked_add_signed(span))
        .ok_or_else(|| DomainError::validation(format!("lease duration out of range: {ttl:?}")))
}
