use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{OperationStatus, RetryLogEntry, ScheduledRetry};
use crate::store::{OperationStore, StoreError, StoreResult};

/// Exponential backoff for bulk operation retries.
///
/// `delay(attempt) = min(initial_delay_ms * backoff_multiplier^(attempt - 1), max_delay_ms)`
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay_ms: u64, backoff_multiplier: f64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            backoff_multiplier,
            max_delay_ms,
        }
    }

    /// Delay before the given 1-based retry attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = (self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    pub fn next_retry_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_for_attempt(attempt);
        now + chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64)
    }

    pub fn has_exceeded_max_retries(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetryDecision {
    Scheduled {
        attempt: i32,
        next_retry_at: DateTime<Utc>,
    },
    Exhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("operation {0} not found")]
    NotFound(Uuid),
    #[error("operation {0} changed while scheduling its retry")]
    Conflict(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Decides between another attempt and terminal failure, and owns the
/// retry log.
#[derive(Clone)]
pub struct RetryEngine {
    store: Arc<dyn OperationStore>,
    policy: RetryPolicy,
}

impl RetryEngine {
    pub fn new(store: Arc<dyn OperationStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failed attempt of `operation_id`.
    ///
    /// Appends the next retry entry while attempts remain, otherwise fails the
    /// operation for good (the active entry is closed as failed either way).
    pub async fn handle_failure(
        &self,
        operation_id: Uuid,
        error_message: &str,
    ) -> Result<RetryDecision, RetryError> {
        let operation = self
            .store
            .find_operation(operation_id)
            .await?
            .ok_or(RetryError::NotFound(operation_id))?;

        let next_attempt = operation.retry_count + 1;
        if next_attempt > operation.max_retries {
            self.store
                .fail_operation_permanently(operation_id, error_message)
                .await?;
            tracing::warn!(
                "Operation {operation_id} failed permanently after {} retries: {error_message}",
                operation.retry_count
            );
            return Ok(RetryDecision::Exhausted);
        }

        let attempt = next_attempt.max(self.store.last_retry_attempt(operation_id).await? + 1);
        let next_retry_at = self.policy.next_retry_at(attempt as u32, Utc::now());
        let retry = ScheduledRetry {
            operation_id,
            retry_attempt: attempt,
            next_retry_at,
            backoff_multiplier: self.policy.backoff_multiplier,
            error_message: Some(error_message.to_string()),
        };

        match self.store.schedule_retry(&retry, operation.retry_count).await {
            Ok(Some(_)) => {
                tracing::info!(
                    "Operation {operation_id} retry {attempt}/{} scheduled for {next_retry_at}",
                    operation.max_retries
                );
                Ok(RetryDecision::Scheduled {
                    attempt,
                    next_retry_at,
                })
            }
            Ok(None) | Err(StoreError::Conflict(_)) => Err(RetryError::Conflict(operation_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Pending entries whose `next_retry_at` has passed (or is unset), earliest first.
    pub async fn pending_retries(&self) -> StoreResult<Vec<RetryLogEntry>> {
        self.store.due_retries(Utc::now()).await
    }

    /// Claim a due entry. `None` means another worker got there first.
    pub async fn claim(&self, entry_id: Uuid) -> StoreResult<Option<RetryLogEntry>> {
        self.store.claim_retry(entry_id).await
    }

    /// Close a claimed entry whose operation could not be started.
    pub async fn abandon(&self, entry_id: Uuid, reason: &str) -> StoreResult<()> {
        self.store
            .close_retry(entry_id, OperationStatus::Failed, Some(reason))
            .await?;
        Ok(())
    }

    pub async fn history(&self, operation_id: Uuid) -> StoreResult<Vec<RetryLogEntry>> {
        self.store.retry_history(operation_id).await
    }
}
