use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::models::{
    BulkOperation, NewBulkOperation, OperationStatus, Progress, RetryLogEntry, ScheduledRetry,
};
use crate::retry::RetryPolicy;
use crate::store::{OperationStore, StoreError, StoreResult};

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("operation {0} not found")]
    NotFound(Uuid),
    #[error("operation {id} is {status}, expected {expected}")]
    InvalidState {
        id: Uuid,
        status: OperationStatus,
        expected: &'static str,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Server-side lifecycle of bulk operations:
/// `pending -> in_progress -> {completed, failed}`, and `failed -> pending`
/// through [`OperationTracker::manual_retry`] only.
#[derive(Clone)]
pub struct OperationTracker {
    store: Arc<dyn OperationStore>,
    policy: RetryPolicy,
}

impl OperationTracker {
    pub fn new(store: Arc<dyn OperationStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn submit(
        &self,
        procedure: &str,
        items: Vec<serde_json::Value>,
    ) -> StoreResult<BulkOperation> {
        let operation = self
            .store
            .create_operation(&NewBulkOperation {
                procedure: procedure.to_string(),
                items,
                max_retries: i32::try_from(self.policy.max_retries).unwrap_or(i32::MAX),
            })
            .await?;
        tracing::info!(
            "Operation {} submitted ({}, {} items)",
            operation.id,
            operation.procedure,
            operation.total_items
        );
        Ok(operation)
    }

    pub async fn get(&self, id: Uuid) -> StoreResult<Option<BulkOperation>> {
        self.store.find_operation(id).await
    }

    pub async fn list(
        &self,
        status: Option<OperationStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<BulkOperation>> {
        self.store.list_operations(status, limit, offset).await
    }

    /// True iff the operation failed and still has retries left.
    pub async fn should_retry(&self, id: Uuid) -> Result<bool, TrackerError> {
        let operation = self
            .store
            .find_operation(id)
            .await?
            .ok_or(TrackerError::NotFound(id))?;
        Ok(operation.status == OperationStatus::Failed
            && operation.retry_count < operation.max_retries)
    }

    /// Claim an operation for execution. `None` when it is not pending/failed,
    /// which includes another worker having claimed it already.
    pub async fn mark_in_progress(&self, id: Uuid) -> StoreResult<Option<BulkOperation>> {
        self.store
            .transition_operation(
                id,
                &[OperationStatus::Pending, OperationStatus::Failed],
                OperationStatus::InProgress,
                None,
            )
            .await
    }

    pub async fn record_progress(&self, id: Uuid, progress: Progress) -> StoreResult<()> {
        self.store.record_progress(id, progress).await
    }

    /// Completes the operation and its active retry entry, if any.
    pub async fn mark_completed(&self, id: Uuid) -> StoreResult<Option<BulkOperation>> {
        let operation = self.store.complete_operation(id).await?;
        if operation.is_some() {
            tracing::info!("Operation {id} completed");
        }
        Ok(operation)
    }

    pub async fn mark_failed(
        &self,
        id: Uuid,
        error_message: &str,
    ) -> StoreResult<Option<BulkOperation>> {
        let operation = self
            .store
            .transition_operation(
                id,
                &[OperationStatus::InProgress],
                OperationStatus::Failed,
                Some(error_message),
            )
            .await?;
        if operation.is_some() {
            tracing::warn!("Operation {id} failed: {error_message}");
        }
        Ok(operation)
    }

    /// Hand back a claimed operation whose attempt could not be recorded.
    /// The retry budget is untouched, so the operation shows up in
    /// [`OperationStore::orphaned_operations`] until its next attempt is logged.
    pub async fn release(&self, id: Uuid, error_message: &str) -> StoreResult<Option<BulkOperation>> {
        let operation = self.store.release_operation(id, error_message).await?;
        if operation.is_some() {
            tracing::warn!("Operation {id} released: {error_message}");
        }
        Ok(operation)
    }

    /// Revive a failed operation: zero its progress, set it pending and log
    /// exactly one new retry entry. This is the only way out of `failed`.
    pub async fn manual_retry(
        &self,
        id: Uuid,
    ) -> Result<(BulkOperation, RetryLogEntry), TrackerError> {
        let operation = self
            .store
            .find_operation(id)
            .await?
            .ok_or(TrackerError::NotFound(id))?;

        if operation.status != OperationStatus::Failed {
            return Err(TrackerError::InvalidState {
                id,
                status: operation.status,
                expected: "failed",
            });
        }

        let attempt = (operation.retry_count + 1).max(self.store.last_retry_attempt(id).await? + 1);
        let retry = ScheduledRetry {
            operation_id: id,
            retry_attempt: attempt,
            next_retry_at: self.policy.next_retry_at(attempt as u32, Utc::now()),
            backoff_multiplier: self.policy.backoff_multiplier,
            error_message: None,
        };

        match self.store.reset_for_manual_retry(&retry).await? {
            Some((operation, entry)) => {
                tracing::info!(
                    "Operation {id} manually retried (attempt {}, due {:?})",
                    entry.retry_attempt,
                    entry.next_retry_at
                );
                Ok((operation, entry))
            }
            None => {
                let status = self
                    .store
                    .find_operation(id)
                    .await?
                    .map(|op| op.status)
                    .ok_or(TrackerError::NotFound(id))?;
                Err(TrackerError::InvalidState {
                    id,
                    status,
                    expected: "failed",
                })
            }
        }
    }
}
