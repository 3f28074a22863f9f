use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db;
use crate::models::{
    BulkOperation, NewBulkOperation, OperationStatus, Progress, RetryLogEntry, ScheduledRetry,
};

use super::{OperationStore, StoreError, StoreResult};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Unique-key violations on the retry log mean another writer appended the
/// same attempt first.
fn map_insert_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            StoreError::Conflict("retry attempt already logged".to_string())
        }
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl OperationStore for PgStore {
    async fn create_operation(&self, new: &NewBulkOperation) -> StoreResult<BulkOperation> {
        Ok(db::bulk_operations::create(&self.pool, new).await?)
    }

    async fn find_operation(&self, id: Uuid) -> StoreResult<Option<BulkOperation>> {
        Ok(db::bulk_operations::find_by_id(&self.pool, id).await?)
    }

    async fn list_operations(
        &self,
        status: Option<OperationStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<BulkOperation>> {
        Ok(db::bulk_operations::list(&self.pool, status, limit, offset).await?)
    }

    async fn transition_operation(
        &self,
        id: Uuid,
        from: &[OperationStatus],
        to: OperationStatus,
        error_message: Option<&str>,
    ) -> StoreResult<Option<BulkOperation>> {
        Ok(db::bulk_operations::transition(&self.pool, id, from, to, error_message).await?)
    }

    async fn record_progress(&self, id: Uuid, progress: Progress) -> StoreResult<()> {
        Ok(db::bulk_operations::record_progress(&self.pool, id, progress).await?)
    }

    async fn runnable_operations(&self, limit: i64) -> StoreResult<Vec<BulkOperation>> {
        Ok(db::bulk_operations::list_runnable(&self.pool, limit).await?)
    }

    async fn orphaned_operations(&self, limit: i64) -> StoreResult<Vec<BulkOperation>> {
        Ok(db::bulk_operations::list_orphaned(&self.pool, limit).await?)
    }

    async fn release_operation(&self, id: Uuid, error: &str) -> StoreResult<Option<BulkOperation>> {
        Ok(db::bulk_operations::release(&self.pool, id, error).await?)
    }

    async fn complete_operation(&self, id: Uuid) -> StoreResult<Option<BulkOperation>> {
        Ok(db::bulk_operations::complete(&self.pool, id).await?)
    }

    async fn fail_operation_permanently(
        &self,
        id: Uuid,
        error: &str,
    ) -> StoreResult<Option<BulkOperation>> {
        Ok(db::bulk_operations::fail_permanently(&self.pool, id, error).await?)
    }

    async fn schedule_retry(
        &self,
        retry: &ScheduledRetry,
        expected_retry_count: i32,
    ) -> StoreResult<Option<RetryLogEntry>> {
        db::retry_log::schedule(&self.pool, retry, expected_retry_count)
            .await
            .map_err(map_insert_error)
    }

    async fn reset_for_manual_retry(
        &self,
        retry: &ScheduledRetry,
    ) -> StoreResult<Option<(BulkOperation, RetryLogEntry)>> {
        db::bulk_operations::reset_for_manual_retry(&self.pool, retry)
            .await
            .map_err(map_insert_error)
    }

    async fn last_retry_attempt(&self, operation_id: Uuid) -> StoreResult<i32> {
        Ok(db::retry_log::last_attempt(&self.pool, operation_id).await?)
    }

    async fn due_retries(&self, now: DateTime<Utc>) -> StoreResult<Vec<RetryLogEntry>> {
        Ok(db::retry_log::list_due(&self.pool, now).await?)
    }

    async fn claim_retry(&self, entry_id: Uuid) -> StoreResult<Option<RetryLogEntry>> {
        Ok(db::retry_log::claim(&self.pool, entry_id).await?)
    }

    async fn close_retry(
        &self,
        entry_id: Uuid,
        status: OperationStatus,
        error: Option<&str>,
    ) -> StoreResult<Option<RetryLogEntry>> {
        Ok(db::retry_log::close(&self.pool, entry_id, status, error).await?)
    }

    async fn retry_history(&self, operation_id: Uuid) -> StoreResult<Vec<RetryLogEntry>> {
        Ok(db::retry_log::list_by_operation(&self.pool, operation_id).await?)
    }
}
