use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::{OperationStatus, RetryLogEntry, ScheduledRetry};

pub async fn insert(
    conn: &mut PgConnection,
    retry: &ScheduledRetry,
) -> Result<RetryLogEntry, sqlx::Error> {
    sqlx::query_as::<_, RetryLogEntry>(
        "INSERT INTO retry_log
             (id, operation_id, retry_attempt, status, error_message, next_retry_at, backoff_multiplier)
         VALUES ($1, $2, $3, 'pending', $4, $5, $6)
         RETURNING *",
    )
    .bind(Uuid::now_v7())
    .bind(retry.operation_id)
    .bind(retry.retry_attempt)
    .bind(retry.error_message.as_deref())
    .bind(retry.next_retry_at)
    .bind(retry.backoff_multiplier)
    .fetch_one(&mut *conn)
    .await
}

/// Close whichever entry of the operation is currently in progress.
pub async fn close_active(
    conn: &mut PgConnection,
    operation_id: Uuid,
    status: OperationStatus,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE retry_log
         SET status = $2, error_message = COALESCE($3, error_message), completed_at = now()
         WHERE operation_id = $1 AND status = 'in_progress'",
    )
    .bind(operation_id)
    .bind(status.as_str())
    .bind(error)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Append the next automatic retry in one transaction.
///
/// `retry_count` doubles as an optimistic lock: the bump only applies if the
/// operation still has `expected_retry_count` retries recorded and is in
/// progress or failed.
pub async fn schedule(
    pool: &PgPool,
    retry: &ScheduledRetry,
    expected_retry_count: i32,
) -> Result<Option<RetryLogEntry>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let bumped = sqlx::query(
        "UPDATE bulk_operations
         SET retry_count = retry_count + 1,
             status = 'failed',
             error_message = COALESCE($3, error_message),
             updated_at = now()
         WHERE id = $1
           AND retry_count = $2
           AND retry_count < max_retries
           AND status IN ('in_progress', 'failed')",
    )
    .bind(retry.operation_id)
    .bind(expected_retry_count)
    .bind(retry.error_message.as_deref())
    .execute(&mut *tx)
    .await?;

    if bumped.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(None);
    }

    close_active(
        &mut tx,
        retry.operation_id,
        OperationStatus::Failed,
        retry.error_message.as_deref(),
    )
    .await?;
    let entry = insert(&mut tx, retry).await?;

    tx.commit().await?;
    Ok(Some(entry))
}

pub async fn last_attempt(pool: &PgPool, operation_id: Uuid) -> Result<i32, sqlx::Error> {
    sqlx::query_scalar::<_, i32>(
        "SELECT COALESCE(MAX(retry_attempt), 0) FROM retry_log WHERE operation_id = $1",
    )
    .bind(operation_id)
    .fetch_one(pool)
    .await
}

pub async fn list_due(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<RetryLogEntry>, sqlx::Error> {
    sqlx::query_as::<_, RetryLogEntry>(
        "SELECT * FROM retry_log
         WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= $1)
         ORDER BY next_retry_at ASC NULLS FIRST, created_at ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await
}

/// Conditional claim: only one caller moves a given entry out of `pending`.
pub async fn claim(pool: &PgPool, id: Uuid) -> Result<Option<RetryLogEntry>, sqlx::Error> {
    sqlx::query_as::<_, RetryLogEntry>(
        "UPDATE retry_log SET status = 'in_progress'
         WHERE id = $1 AND status = 'pending'
         RETURNING *",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn close(
    pool: &PgPool,
    id: Uuid,
    status: OperationStatus,
    error: Option<&str>,
) -> Result<Option<RetryLogEntry>, sqlx::Error> {
    sqlx::query_as::<_, RetryLogEntry>(
        "UPDATE retry_log
         SET status = $2, error_message = COALESCE($3, error_message), completed_at = now()
         WHERE id = $1 AND status = 'in_progress'
         RETURNING *",
    )
    .bind(id)
    .bind(status.as_str())
    .bind(error)
    .fetch_optional(pool)
    .await
}

pub async fn list_by_operation(
    pool: &PgPool,
    operation_id: Uuid,
) -> Result<Vec<RetryLogEntry>, sqlx::Error> {
    sqlx::query_as::<_, RetryLogEntry>(
        "SELECT * FROM retry_log WHERE operation_id = $1 ORDER BY retry_attempt ASC",
    )
    .bind(operation_id)
    .fetch_all(pool)
    .await
}
