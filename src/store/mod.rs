//! Persistence seam for bulk operations and their retry log.
//!
//! Handlers, the tracker, the retry engine and the workers only ever talk to
//! an [`OperationStore`] injected through [`crate::state::AppState`]. Every
//! method that moves an operation or entry between states is conditional, so
//! concurrent workers racing on the same row see exactly one winner (`Some`)
//! and everybody else gets `None`.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    BulkOperation, NewBulkOperation, OperationStatus, Progress, RetryLogEntry, ScheduledRetry,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("conflict: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn create_operation(&self, new: &NewBulkOperation) -> StoreResult<BulkOperation>;

    async fn find_operation(&self, id: Uuid) -> StoreResult<Option<BulkOperation>>;

    /// Newest first.
    async fn list_operations(
        &self,
        status: Option<OperationStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<BulkOperation>>;

    async fn transition_operation(
        &self,
        id: Uuid,
        from: &[OperationStatus],
        to: OperationStatus,
        error_message: Option<&str>,
    ) -> StoreResult<Option<BulkOperation>>;

    async fn record_progress(&self, id: Uuid, progress: Progress) -> StoreResult<()>;

    /// Pending operations with no open retry entry, oldest first.
    async fn runnable_operations(&self, limit: i64) -> StoreResult<Vec<BulkOperation>>;

    /// Failed, non-terminal operations with retries left but no open entry,
    /// oldest first. These lost their next attempt to an interrupted worker.
    async fn orphaned_operations(&self, limit: i64) -> StoreResult<Vec<BulkOperation>>;

    /// `in_progress -> failed` without touching `retry_count`, closing the
    /// active retry entry as failed.
    async fn release_operation(&self, id: Uuid, error: &str) -> StoreResult<Option<BulkOperation>>;

    /// `in_progress -> completed`, closing the active retry entry as completed.
    async fn complete_operation(&self, id: Uuid) -> StoreResult<Option<BulkOperation>>;

    /// Terminal failure, closing the active retry entry as failed.
    async fn fail_operation_permanently(
        &self,
        id: Uuid,
        error: &str,
    ) -> StoreResult<Option<BulkOperation>>;

    /// Close the active entry as failed, append `retry` and bump `retry_count`
    /// from `expected_retry_count`, atomically. Only an in-progress or failed
    /// operation can be scheduled.
    async fn schedule_retry(
        &self,
        retry: &ScheduledRetry,
        expected_retry_count: i32,
    ) -> StoreResult<Option<RetryLogEntry>>;

    /// `failed -> pending` with zeroed progress plus one new entry, atomically.
    async fn reset_for_manual_retry(
        &self,
        retry: &ScheduledRetry,
    ) -> StoreResult<Option<(BulkOperation, RetryLogEntry)>>;

    /// Highest attempt number logged for the operation, 0 when none.
    async fn last_retry_attempt(&self, operation_id: Uuid) -> StoreResult<i32>;

    async fn due_retries(&self, now: DateTime<Utc>) -> StoreResult<Vec<RetryLogEntry>>;

    /// `pending -> in_progress` for one entry.
    async fn claim_retry(&self, entry_id: Uuid) -> StoreResult<Option<RetryLogEntry>>;

    /// Close an in-progress entry with a final status.
    async fn close_retry(
        &self,
        entry_id: Uuid,
        status: OperationStatus,
        error: Option<&str>,
    ) -> StoreResult<Option<RetryLogEntry>>;

    async fn retry_history(&self, operation_id: Uuid) -> StoreResult<Vec<RetryLogEntry>>;
}
