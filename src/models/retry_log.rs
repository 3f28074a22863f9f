use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::OperationStatus;

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct RetryLogEntry {
    pub id: Uuid,
    pub operation_id: Uuid,
    pub retry_attempt: i32,
    #[sqlx(try_from = "String")]
    pub status: OperationStatus,
    pub error_message: Option<String>,
    /// `None` means due immediately.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub backoff_multiplier: f64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RetryLogEntry {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OperationStatus::Pending
            && self.next_retry_at.is_none_or(|at| at <= now)
    }
}

/// A retry the engine wants appended to an operation's log.
#[derive(Debug, Clone)]
pub struct ScheduledRetry {
    pub operation_id: Uuid,
    pub retry_attempt: i32,
    pub next_retry_at: DateTime<Utc>,
    pub backoff_multiplier: f64,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: OperationStatus, next_retry_at: Option<DateTime<Utc>>) -> RetryLogEntry {
        RetryLogEntry {
            id: Uuid::now_v7(),
            operation_id: Uuid::now_v7(),
            retry_attempt: 1,
            status,
            error_message: None,
            next_retry_at,
            backoff_multiplier: 2.0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn unscheduled_entry_is_due_immediately() {
        let now = Utc::now();
        assert!(entry(OperationStatus::Pending, None).is_due(now));
        assert!(!entry(OperationStatus::InProgress, None).is_due(now));
    }

    #[test]
    fn scheduled_entry_waits_for_its_time() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(30);

        assert!(!entry(OperationStatus::Pending, Some(later)).is_due(now));
        assert!(entry(OperationStatus::Pending, Some(now)).is_due(now));
        assert!(entry(OperationStatus::Pending, Some(later)).is_due(later));
    }
}
