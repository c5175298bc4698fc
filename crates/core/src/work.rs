//! Work item types and the `pending -> running -> done | error` lifecycle.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::WorkItemId;

/// Reason a piece of background work was requested.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Summarize a game's latest patch notes.
    PatchSummary,
    /// Summarize a news article.
    NewsSummary,
    /// Refresh the seasonal discovery shelf.
    DiscoverSeasonal,
    /// Suggest backlog games worth returning to.
    ReturnMatch,
    /// Refresh the upcoming releases shelf.
    DiscoverReleases,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::PatchSummary,
        JobType::NewsSummary,
        JobType::DiscoverSeasonal,
        JobType::ReturnMatch,
        JobType::DiscoverReleases,
    ];

    /// Stored/serialized tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::PatchSummary => "PATCH_SUMMARY",
            JobType::NewsSummary => "NEWS_SUMMARY",
            JobType::DiscoverSeasonal => "DISCOVER_SEASONAL",
            JobType::ReturnMatch => "RETURN_MATCH",
            JobType::DiscoverReleases => "DISCOVER_RELEASES",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::invalid_id(format!("unknown job type: {s}")))
    }
}

/// Work item status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a worker
    Running,
    /// Finished successfully
    Done,
    /// Finished with an error
    Error,
}

impl WorkStatus {
    /// Pending and running rows make up the active set (at most one per key).
    pub fn is_active(&self) -> bool {
        matches!(self, WorkStatus::Pending | WorkStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Running => "running",
            WorkStatus::Done => "done",
            WorkStatus::Error => "error",
        }
    }
}

impl core::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkStatus::Pending),
            "running" => Ok(WorkStatus::Running),
            "done" => Ok(WorkStatus::Done),
            "error" => Ok(WorkStatus::Error),
            other => Err(DomainError::invalid_id(format!("unknown work status: {other}"))),
        }
    }
}

/// How a claimed item finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOutcome {
    Done,
    Error(String),
}

impl WorkOutcome {
    pub fn status(&self) -> WorkStatus {
        match self {
            WorkOutcome::Done => WorkStatus::Done,
            WorkOutcome::Error(_) => WorkStatus::Error,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            WorkOutcome::Done => None,
            WorkOutcome::Error(msg) => Some(msg),
        }
    }
}

/// One unit of asynchronous work, keyed by (`job_type`, `entity_id`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub job_type: JobType,
    pub entity_id: String,
    pub status: WorkStatus,
    /// Number of times the item has been claimed.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// A fresh `pending` item.
    pub fn new(job_type: JobType, entity_id: &str, now: DateTime<Utc>) -> DomainResult<Self> {
        validate_entity_id(entity_id)?;
        Ok(Self {
            id: WorkItemId::new(),
            job_type,
            entity_id: entity_id.to_string(),
            status: WorkStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_key(&self, job_type: JobType, entity_id: &str) -> bool {
        self.job_type == job_type && self.entity_id == entity_id
    }

    /// `pending -> running`, counting the attempt.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(WorkStatus::Pending, "claim")?;
        self.status = WorkStatus::Running;
        self.attempts += 1;
        self.updated_at = now;
        Ok(())
    }

    /// `running -> done | error`.
    pub fn finish(&mut self, outcome: &WorkOutcome, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(WorkStatus::Running, "complete")?;
        self.status = outcome.status();
        self.last_error = outcome.error_message().map(str::to_string);
        self.updated_at = now;
        Ok(())
    }

    /// `error -> pending`, only through an explicit retry.
    pub fn mark_requeued(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(WorkStatus::Error, "requeue")?;
        self.status = WorkStatus::Pending;
        self.updated_at = now;
        Ok(())
    }

    fn expect_status(&self, expected: WorkStatus, action: &str) -> DomainResult<()> {
        if self.status != expected {
            return Err(DomainError::invalid_transition(format!(
                "cannot {action} work item {} in status {}",
                self.id, self.status
            )));
        }
        Ok(())
    }
}

/// Entity ids are opaque but must be non-empty.
pub fn validate_entity_id(entity_id: &str) -> DomainResult<()> {
    if entity_id.trim().is_empty() {
        return Err(DomainError::validation("entity id must not be empty"));
    }
    Ok(())
}
