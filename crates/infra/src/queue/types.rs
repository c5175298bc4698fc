//! Queue-level types: receipts, statistics, errors and the explicit retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use questlog_core::{DomainError, WorkItem, WorkItemId, WorkStatus};

/// What `enqueue` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnqueueReceipt {
    pub id: WorkItemId,
    /// `false` when an already active row for the key was returned instead.
    pub created: bool,
}

/// Work item counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub error: usize,
}

impl QueueStats {
    pub fn record(&mut self, status: WorkStatus) {
        match status {
            WorkStatus::Pending => self.pending += 1,
            WorkStatus::Running => self.running += 1,
            WorkStatus::Done => self.done += 1,
            WorkStatus::Error => self.error += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.done + self.error
    }
}

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("work item not found: {0}")]
    NotFound(WorkItemId),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error(transparent)]
    Invalid(DomainError),
    #[error("enqueue kept racing with completions for {job_type}/{entity_id}")]
    Contended { job_type: String, entity_id: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for QueueError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition(msg) => QueueError::InvalidTransition(msg),
            other => QueueError::Invalid(other),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Policy for the explicit `error -> pending` retry pass.
///
/// Nothing is ever retried unless a caller runs `requeue_errored` with a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Items with this many attempts or more stay in `error`
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay to wait after the given attempt (1-indexed) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay)
    }

    /// Whether an `error` item may go back to `pending` at `now`.
    pub fn is_due(&self, item: &WorkItem, now: DateTime<Utc>) -> bool {
        if item.status != WorkStatus::Error || item.attempts >= self.max_attempts {
            return false;
        }
        let delay = chrono::Duration::from_std(self.delay_for_attempt(item.attempts))
            .unwrap_or(chrono::Duration::MAX);
        match item.updated_at.checked_add_signed(delay) {
            Some(due_at) => now >= due_at,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use questlog_core::{JobType, WorkOutcome};

    use super::*;

    fn failed_item(attempts: u32, failed_at: DateTime<Utc>) -> WorkItem {
        let mut item = WorkItem::new(JobType::PatchSummary, "game-1", failed_at).unwrap();
        for _ in 0..attempts {
            item.status = WorkStatus::Pending;
            item.mark_running(failed_at).unwrap();
            item.finish(&WorkOutcome::Error("boom".into()), failed_at).unwrap();
        }
        item
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(
            5,
            Duration::from_millis(100),
            Duration::from_secs(10),
        );

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn due_only_after_backoff_and_below_max_attempts() {
        let failed_at = Utc::now();
        let policy = RetryPolicy::fixed(2, Duration::from_secs(30));

        let once = failed_item(1, failed_at);
        assert!(!policy.is_due(&once, failed_at + chrono::Duration::seconds(29)));
        assert!(policy.is_due(&once, failed_at + chrono::Duration::seconds(30)));

        let twice = failed_item(2, failed_at);
        assert!(!policy.is_due(&twice, failed_at + chrono::Duration::days(1)));
    }

    #[test]
    fn only_error_items_are_due() {
        let now = Utc::now();
        let pending = WorkItem::new(JobType::NewsSummary, "article-9", now).unwrap();
        assert!(!RetryPolicy::fixed(3, Duration::ZERO).is_due(&pending, now));
    }

    #[test]
    fn stats_count_each_status() {
        let mut stats = QueueStats::default();
        stats.record(WorkStatus::Pending);
        stats.record(WorkStatus::Pending);
        stats.record(WorkStatus::Error);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.error, 1);
        assert_eq!(stats.total(), 3);
    }
}
