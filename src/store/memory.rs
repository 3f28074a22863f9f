use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{
    BulkOperation, NewBulkOperation, OperationStatus, Progress, RetryLogEntry, ScheduledRetry,
};

use super::{OperationStore, StoreError, StoreResult};

/// In-process store with the same conditional semantics as [`super::PgStore`].
/// Every call holds one lock over both tables, which stands in for a transaction.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    operations: HashMap<Uuid, BulkOperation>,
    retry_log: Vec<RetryLogEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tables {
    fn close_active(
        &mut self,
        operation_id: Uuid,
        status: OperationStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) {
        for entry in self.retry_log.iter_mut().filter(|e| {
            e.operation_id == operation_id && e.status == OperationStatus::InProgress
        }) {
            entry.status = status;
            if let Some(error) = error {
                entry.error_message = Some(error.to_string());
            }
            entry.completed_at = Some(now);
        }
    }

    fn insert_retry(&mut self, retry: &ScheduledRetry, now: DateTime<Utc>) -> StoreResult<RetryLogEntry> {
        let duplicate = self.retry_log.iter().any(|e| {
            e.operation_id == retry.operation_id && e.retry_attempt == retry.retry_attempt
        });
        if duplicate {
            return Err(StoreError::Conflict("retry attempt already logged".to_string()));
        }

        let entry = RetryLogEntry {
            id: Uuid::now_v7(),
            operation_id: retry.operation_id,
            retry_attempt: retry.retry_attempt,
            status: OperationStatus::Pending,
            error_message: retry.error_message.clone(),
            next_retry_at: Some(retry.next_retry_at),
            backoff_multiplier: retry.backoff_multiplier,
            created_at: now,
            completed_at: None,
        };
        self.retry_log.push(entry.clone());
        Ok(entry)
    }

    fn oldest(&self, limit: i64, keep: impl Fn(&BulkOperation) -> bool) -> Vec<BulkOperation> {
        let mut operations: Vec<BulkOperation> = self
            .operations
            .values()
            .filter(|&op| keep(op) && !self.has_open_retry(op.id))
            .cloned()
            .collect();
        operations.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        operations.truncate(limit.max(0) as usize);
        operations
    }

    fn has_open_retry(&self, operation_id: Uuid) -> bool {
        self.retry_log.iter().any(|e| {
            e.operation_id == operation_id
                && matches!(e.status, OperationStatus::Pending | OperationStatus::InProgress)
        })
    }
}

#[async_trait]
impl OperationStore for MemoryStore {
    async fn create_operation(&self, new: &NewBulkOperation) -> StoreResult<BulkOperation> {
        let now = Utc::now();
        let operation = BulkOperation {
            id: Uuid::now_v7(),
            procedure: new.procedure.clone(),
            items: serde_json::Value::Array(new.items.clone()),
            status: OperationStatus::Pending,
            total_items: new.items.len() as i32,
            processed_items: 0,
            success_count: 0,
            failure_count: 0,
            retry_count: 0,
            max_retries: new.max_retries,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let mut tables = self.tables.lock().await;
        tables.operations.insert(operation.id, operation.clone());
        Ok(operation)
    }

    async fn find_operation(&self, id: Uuid) -> StoreResult<Option<BulkOperation>> {
        let tables = self.tables.lock().await;
        Ok(tables.operations.get(&id).cloned())
    }

    async fn list_operations(
        &self,
        status: Option<OperationStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<BulkOperation>> {
        let tables = self.tables.lock().await;
        let mut operations: Vec<BulkOperation> = tables
            .operations
            .values()
            .filter(|op| status.is_none_or(|s| op.status == s))
            .cloned()
            .collect();
        operations.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        Ok(operations
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn transition_operation(
        &self,
        id: Uuid,
        from: &[OperationStatus],
        to: OperationStatus,
        error_message: Option<&str>,
    ) -> StoreResult<Option<BulkOperation>> {
        let mut tables = self.tables.lock().await;
        let Some(operation) = tables.operations.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&operation.status) {
            return Ok(None);
        }

        operation.status = to;
        if let Some(error) = error_message {
            operation.error_message = Some(error.to_string());
        }
        operation.updated_at = Utc::now();
        Ok(Some(operation.clone()))
    }

    async fn record_progress(&self, id: Uuid, progress: Progress) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(operation) = tables.operations.get_mut(&id) {
            operation.processed_items = progress.processed_items;
            operation.success_count = progress.success_count;
            operation.failure_count = progress.failure_count;
            operation.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn runnable_operations(&self, limit: i64) -> StoreResult<Vec<BulkOperation>> {
        let tables = self.tables.lock().await;
        Ok(tables.oldest(limit, |op| op.status == OperationStatus::Pending))
    }

    async fn orphaned_operations(&self, limit: i64) -> StoreResult<Vec<BulkOperation>> {
        let tables = self.tables.lock().await;
        Ok(tables.oldest(limit, |op| {
            op.status == OperationStatus::Failed
                && op.completed_at.is_none()
                && op.retry_count < op.max_retries
        }))
    }

    async fn release_operation(&self, id: Uuid, error: &str) -> StoreResult<Option<BulkOperation>> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        let released = match tables.operations.get_mut(&id) {
            Some(op) if op.status == OperationStatus::InProgress => {
                op.status = OperationStatus::Failed;
                op.error_message = Some(error.to_string());
                op.updated_at = now;
                op.clone()
            }
            _ => return Ok(None),
        };
        tables.close_active(id, OperationStatus::Failed, Some(error), now);
        Ok(Some(released))
    }

    async fn complete_operation(&self, id: Uuid) -> StoreResult<Option<BulkOperation>> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        let completed = match tables.operations.get_mut(&id) {
            Some(op) if op.status == OperationStatus::InProgress => {
                op.status = OperationStatus::Completed;
                op.error_message = None;
                op.completed_at = Some(now);
                op.updated_at = now;
                op.clone()
            }
            _ => return Ok(None),
        };
        tables.close_active(id, OperationStatus::Completed, None, now);
        Ok(Some(completed))
    }

    async fn fail_operation_permanently(
        &self,
        id: Uuid,
        error: &str,
    ) -> StoreResult<Option<BulkOperation>> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        let failed = match tables.operations.get_mut(&id) {
            Some(op)
                if matches!(op.status, OperationStatus::InProgress | OperationStatus::Failed) =>
            {
                op.status = OperationStatus::Failed;
                op.error_message = Some(error.to_string());
                op.completed_at = Some(now);
                op.updated_at = now;
                op.clone()
            }
            _ => return Ok(None),
        };
        tables.close_active(id, OperationStatus::Failed, Some(error), now);
        Ok(Some(failed))
    }

    async fn schedule_retry(
        &self,
        retry: &ScheduledRetry,
        expected_retry_count: i32,
    ) -> StoreResult<Option<RetryLogEntry>> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;

        match tables.operations.get(&retry.operation_id) {
            Some(op)
                if op.retry_count == expected_retry_count
                    && op.retry_count < op.max_retries
                    && matches!(op.status, OperationStatus::InProgress | OperationStatus::Failed) => {}
            _ => return Ok(None),
        }

        // Insert first so a conflict leaves everything untouched.
        let entry = tables.insert_retry(retry, now)?;
        let error = retry.error_message.as_deref();
        tables.close_active(retry.operation_id, OperationStatus::Failed, error, now);

        if let Some(op) = tables.operations.get_mut(&retry.operation_id) {
            op.retry_count += 1;
            op.status = OperationStatus::Failed;
            if let Some(error) = error {
                op.error_message = Some(error.to_string());
            }
            op.updated_at = now;
        }
        Ok(Some(entry))
    }

    async fn reset_for_manual_retry(
        &self,
        retry: &ScheduledRetry,
    ) -> StoreResult<Option<(BulkOperation, RetryLogEntry)>> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;

        match tables.operations.get(&retry.operation_id) {
            Some(op) if op.status == OperationStatus::Failed => {}
            _ => return Ok(None),
        }

        let entry = tables.insert_retry(retry, now)?;

        let Some(op) = tables.operations.get_mut(&retry.operation_id) else {
            return Ok(None);
        };
        op.status = OperationStatus::Pending;
        op.processed_items = 0;
        op.success_count = 0;
        op.failure_count = 0;
        op.error_message = None;
        op.completed_at = None;
        op.updated_at = now;
        Ok(Some((op.clone(), entry)))
    }

    async fn last_retry_attempt(&self, operation_id: Uuid) -> StoreResult<i32> {
        let tables = self.tables.lock().await;
        Ok(tables
            .retry_log
            .iter()
            .filter(|e| e.operation_id == operation_id)
            .map(|e| e.retry_attempt)
            .max()
            .unwrap_or(0))
    }

    async fn due_retries(&self, now: DateTime<Utc>) -> StoreResult<Vec<RetryLogEntry>> {
        let tables = self.tables.lock().await;
        let mut due: Vec<RetryLogEntry> = tables
            .retry_log
            .iter()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        // NULLS FIRST, then earliest due.
        due.sort_by(|a, b| (a.next_retry_at, a.created_at).cmp(&(b.next_retry_at, b.created_at)));
        Ok(due)
    }

    async fn claim_retry(&self, entry_id: Uuid) -> StoreResult<Option<RetryLogEntry>> {
        let mut tables = self.tables.lock().await;
        match tables.retry_log.iter_mut().find(|e| e.id == entry_id) {
            Some(entry) if entry.status == OperationStatus::Pending => {
                entry.status = OperationStatus::InProgress;
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn close_retry(
        &self,
        entry_id: Uuid,
        status: OperationStatus,
        error: Option<&str>,
    ) -> StoreResult<Option<RetryLogEntry>> {
        let mut tables = self.tables.lock().await;
        match tables.retry_log.iter_mut().find(|e| e.id == entry_id) {
            Some(entry) if entry.status == OperationStatus::InProgress => {
                entry.status = status;
                if let Some(error) = error {
                    entry.error_message = Some(error.to_string());
                }
                entry.completed_at = Some(Utc::now());
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn retry_history(&self, operation_id: Uuid) -> StoreResult<Vec<RetryLogEntry>> {
        let tables = self.tables.lock().await;
        let mut history: Vec<RetryLogEntry> = tables
            .retry_log
            .iter()
            .filter(|e| e.operation_id == operation_id)
            .cloned()
            .collect();
        history.sort_by_key(|e| e.retry_attempt);
        Ok(history)
    }
}
