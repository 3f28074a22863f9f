use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{
    BulkOperation, NewBulkOperation, OperationStatus, Progress, RetryLogEntry, ScheduledRetry,
};

use super::retry_log;

pub async fn create(pool: &PgPool, new: &NewBulkOperation) -> Result<BulkOperation, sqlx::Error> {
    sqlx::query_as::<_, BulkOperation>(
        "INSERT INTO bulk_operations (id, procedure_name, items, total_items, max_retries)
         VALUES ($1, $2, $3, $4, $5) RETURNING *",
    )
    .bind(Uuid::now_v7())
    .bind(&new.procedure)
    .bind(serde_json::Value::Array(new.items.clone()))
    .bind(new.items.len() as i32)
    .bind(new.max_retries)
    .fetch_one(pool)
    .await
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<BulkOperation>, sqlx::Error> {
    sqlx::query_as::<_, BulkOperation>("SELECT * FROM bulk_operations WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn list(
    pool: &PgPool,
    status: Option<OperationStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<BulkOperation>, sqlx::Error> {
    sqlx::query_as::<_, BulkOperation>(
        "SELECT * FROM bulk_operations
         WHERE ($1::text IS NULL OR status = $1)
         ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3",
    )
    .bind(status.map(|s| s.as_str()))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

/// Conditional status change. Returns `None` when the current status is not in `from`.
pub async fn transition(
    pool: &PgPool,
    id: Uuid,
    from: &[OperationStatus],
    to: OperationStatus,
    error_message: Option<&str>,
) -> Result<Option<BulkOperation>, sqlx::Error> {
    let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
    sqlx::query_as::<_, BulkOperation>(
        "UPDATE bulk_operations
         SET status = $2,
             error_message = COALESCE($3, error_message),
             updated_at = now()
         WHERE id = $1 AND status = ANY($4)
         RETURNING *",
    )
    .bind(id)
    .bind(to.as_str())
    .bind(error_message)
    .bind(from)
    .fetch_optional(pool)
    .await
}

pub async fn record_progress(pool: &PgPool, id: Uuid, progress: Progress) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE bulk_operations
         SET processed_items = $2, success_count = $3, failure_count = $4, updated_at = now()
         WHERE id = $1",
    )
    .bind(id)
    .bind(progress.processed_items)
    .bind(progress.success_count)
    .bind(progress.failure_count)
    .execute(pool)
    .await?;
    Ok(())
}

/// Pending operations that have never been attempted, oldest first.
/// Operations with an open retry entry are reached through the retry log instead.
pub async fn list_runnable(pool: &PgPool, limit: i64) -> Result<Vec<BulkOperation>, sqlx::Error> {
    sqlx::query_as::<_, BulkOperation>(
        "SELECT * FROM bulk_operations o
         WHERE o.status = 'pending'
           AND NOT EXISTS (
               SELECT 1 FROM retry_log r
               WHERE r.operation_id = o.id AND r.status IN ('pending', 'in_progress')
           )
         ORDER BY o.created_at ASC, o.id ASC
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Failed operations with retries left whose next attempt was never logged.
pub async fn list_orphaned(pool: &PgPool, limit: i64) -> Result<Vec<BulkOperation>, sqlx::Error> {
    sqlx::query_as::<_, BulkOperation>(
        "SELECT * FROM bulk_operations o
         WHERE o.status = 'failed'
           AND o.completed_at IS NULL
           AND o.retry_count < o.max_retries
           AND NOT EXISTS (
               SELECT 1 FROM retry_log r
               WHERE r.operation_id = o.id AND r.status IN ('pending', 'in_progress')
           )
         ORDER BY o.created_at ASC, o.id ASC
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Give up a claimed attempt: the operation goes back to `failed` with its
/// retry budget untouched and the active entry is closed as failed.
pub async fn release(
    pool: &PgPool,
    id: Uuid,
    error: &str,
) -> Result<Option<BulkOperation>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let operation = sqlx::query_as::<_, BulkOperation>(
        "UPDATE bulk_operations
         SET status = 'failed', error_message = $2, updated_at = now()
         WHERE id = $1 AND status = 'in_progress'
         RETURNING *",
    )
    .bind(id)
    .bind(error)
    .fetch_optional(&mut *tx)
    .await?;

    if operation.is_some() {
        retry_log::close_active(&mut tx, id, OperationStatus::Failed, Some(error)).await?;
    }

    tx.commit().await?;
    Ok(operation)
}

/// Mark an in-progress operation completed, closing its active retry entry.
pub async fn complete(pool: &PgPool, id: Uuid) -> Result<Option<BulkOperation>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let operation = sqlx::query_as::<_, BulkOperation>(
        "UPDATE bulk_operations
         SET status = 'completed', error_message = NULL, completed_at = now(), updated_at = now()
         WHERE id = $1 AND status = 'in_progress'
         RETURNING *",
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;

    if operation.is_some() {
        retry_log::close_active(&mut tx, id, OperationStatus::Completed, None).await?;
    }

    tx.commit().await?;
    Ok(operation)
}

/// Terminal failure: no further automatic retries.
pub async fn fail_permanently(
    pool: &PgPool,
    id: Uuid,
    error: &str,
) -> Result<Option<BulkOperation>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let operation = sqlx::query_as::<_, BulkOperation>(
        "UPDATE bulk_operations
         SET status = 'failed', error_message = $2, completed_at = now(), updated_at = now()
         WHERE id = $1 AND status IN ('in_progress', 'failed')
         RETURNING *",
    )
    .bind(id)
    .bind(error)
    .fetch_optional(&mut *tx)
    .await?;

    if operation.is_some() {
        retry_log::close_active(&mut tx, id, OperationStatus::Failed, Some(error)).await?;
    }

    tx.commit().await?;
    Ok(operation)
}

/// Reset a failed operation to pending and append the manual retry entry.
/// Returns `None` if the operation is not failed (or changed underneath us).
pub async fn reset_for_manual_retry(
    pool: &PgPool,
    retry: &ScheduledRetry,
) -> Result<Option<(BulkOperation, RetryLogEntry)>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let operation = sqlx::query_as::<_, BulkOperation>(
        "UPDATE bulk_operations
         SET status = 'pending',
             processed_items = 0,
             success_count = 0,
             failure_count = 0,
             error_message = NULL,
             completed_at = NULL,
             updated_at = now()
         WHERE id = $1 AND status = 'failed'
         RETURNING *",
    )
    .bind(retry.operation_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(operation) = operation else {
        tx.rollback().await?;
        return Ok(None);
    };

    let entry = retry_log::insert(&mut tx, retry).await?;

    tx.commit().await?;
    Ok(Some((operation, entry)))
}
