mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use fieldsync::models::{
    BulkOperation, NewBulkOperation, OperationStatus, Progress, RetryLogEntry, ScheduledRetry,
};
use fieldsync::state::SharedState;
use fieldsync::store::{MemoryStore, OperationStore, StoreError, StoreResult};

/// Delegates to [`MemoryStore`], failing the next N calls of selected
/// methods with a pool timeout.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryStore,
    schedule_faults: AtomicU32,
    progress_faults: AtomicU32,
    complete_faults: AtomicU32,
}

fn trip(faults: &AtomicU32) -> StoreResult<()> {
    let tripped = faults
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if tripped {
        return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
    }
    Ok(())
}

#[async_trait]
impl OperationStore for FaultyStore {
    async fn create_operation(&self, new: &NewBulkOperation) -> StoreResult<BulkOperation> {
        self.inner.create_operation(new).await
    }

    async fn find_operation(&self, id: Uuid) -> StoreResult<Option<BulkOperation>> {
        self.inner.find_operation(id).await
    }

    async fn list_operations(
        &self,
        status: Option<OperationStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<BulkOperation>> {
        self.inner.list_operations(status, limit, offset).await
    }

    async fn transition_operation(
        &self,
        id: Uuid,
        from: &[OperationStatus],
        to: OperationStatus,
        error_message: Option<&str>,
    ) -> StoreResult<Option<BulkOperation>> {
        self.inner.transition_operation(id, from, to, error_message).await
    }

    async fn record_progress(&self, id: Uuid, progress: Progress) -> StoreResult<()> {
        trip(&self.progress_faults)?;
        self.inner.record_progress(id, progress).await
    }

    async fn runnable_operations(&self, limit: i64) -> StoreResult<Vec<BulkOperation>> {
        self.inner.runnable_operations(limit).await
    }

    async fn orphaned_operations(&self, limit: i64) -> StoreResult<Vec<BulkOperation>> {
        self.inner.orphaned_operations(limit).await
    }

    async fn release_operation(&self, id: Uuid, error: &str) -> StoreResult<Option<BulkOperation>> {
        self.inner.release_operation(id, error).await
    }

    async fn complete_operation(&self, id: Uuid) -> StoreResult<Option<BulkOperation>> {
        trip(&self.complete_faults)?;
        self.inner.complete_operation(id).await
    }

    async fn fail_operation_permanently(
        &self,
        id: Uuid,
        error: &str,
    ) -> StoreResult<Option<BulkOperation>> {
        self.inner.fail_operation_permanently(id, error).await
    }

    async fn schedule_retry(
        &self,
        retry: &ScheduledRetry,
        expected_retry_count: i32,
    ) -> StoreResult<Option<RetryLogEntry>> {
        trip(&self.schedule_faults)?;
        self.inner.schedule_retry(retry, expected_retry_count).await
    }

    async fn reset_for_manual_retry(
        &self,
        retry: &ScheduledRetry,
    ) -> StoreResult<Option<(BulkOperation, RetryLogEntry)>> {
        self.inner.reset_for_manual_retry(retry).await
    }

    async fn last_retry_attempt(&self, operation_id: Uuid) -> StoreResult<i32> {
        self.inner.last_retry_attempt(operation_id).await
    }

    async fn due_retries(&self, now: DateTime<Utc>) -> StoreResult<Vec<RetryLogEntry>> {
        self.inner.due_retries(now).await
    }

    async fn claim_retry(&self, entry_id: Uuid) -> StoreResult<Option<RetryLogEntry>> {
        self.inner.claim_retry(entry_id).await
    }

    async fn close_retry(
        &self,
        entry_id: Uuid,
        status: OperationStatus,
        error: Option<&str>,
    ) -> StoreResult<Option<RetryLogEntry>> {
        self.inner.close_retry(entry_id, status, error).await
    }

    async fn retry_history(&self, operation_id: Uuid) -> StoreResult<Vec<RetryLogEntry>> {
        self.inner.retry_history(operation_id).await
    }
}

async fn spawn_faulty(flaky_failures: u32) -> (common::TestApp, Arc<FaultyStore>) {
    let store = Arc::new(FaultyStore::default());
    let app = common::spawn_app_on(store.clone(), common::instant_retries(), flaky_failures).await;
    (app, store)
}

/// Worker iterations until idle, bounded so a stuck loop fails the test.
async fn drain(state: &SharedState) -> usize {
    for processed in 0..20 {
        let more = fieldsync::worker::process_next(state)
            .await
            .expect("worker iteration failed");
        if !more {
            return processed;
        }
    }
    panic!("worker never went idle");
}

async fn attempts(state: &SharedState, id: Uuid) -> Vec<(i32, OperationStatus)> {
    state
        .engine
        .history(id)
        .await
        .unwrap()
        .iter()
        .map(|e| (e.retry_attempt, e.status))
        .collect()
}

#[tokio::test]
async fn lost_schedule_write_is_recovered() {
    let (app, store) = spawn_faulty(0).await;
    store.schedule_faults.store(1, Ordering::SeqCst);
    let state = &app.state;
    let op = state.tracker.submit("records.broken", vec![json!({ "id": 1 })]).await.unwrap();

    let err = fieldsync::worker::process_next(state).await.unwrap_err();
    assert!(err.contains("Failed to schedule retry"), "{err}");

    let stranded = state.tracker.get(op.id).await.unwrap().unwrap();
    assert_eq!(stranded.status, OperationStatus::Failed);
    assert_eq!(stranded.retry_count, 0);
    assert!(state.tracker.should_retry(op.id).await.unwrap());

    // One recovery pass, then the three scheduled retries.
    assert_eq!(drain(state).await, 4);

    let op = state.tracker.get(op.id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.retry_count, 3);
    assert!(op.completed_at.is_some());
    assert!(!state.tracker.should_retry(op.id).await.unwrap());
    assert_eq!(
        attempts(state, op.id).await,
        vec![
            (1, OperationStatus::Failed),
            (2, OperationStatus::Failed),
            (3, OperationStatus::Failed),
        ]
    );
}

#[tokio::test]
async fn lost_completion_write_is_retried() {
    let (app, store) = spawn_faulty(0).await;
    store.complete_faults.store(1, Ordering::SeqCst);
    let state = &app.state;
    let op = state.tracker.submit("records.echo", vec![json!({ "id": 1 })]).await.unwrap();

    let err = fieldsync::worker::process_next(state).await.unwrap_err();
    assert!(err.contains("Failed to complete operation"), "{err}");
    let released = state.tracker.get(op.id).await.unwrap().unwrap();
    assert_eq!(released.status, OperationStatus::Failed);

    assert_eq!(drain(state).await, 2);

    let op = state.tracker.get(op.id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.retry_count, 1);
    assert_eq!(attempts(state, op.id).await, vec![(1, OperationStatus::Completed)]);
}

#[tokio::test]
async fn interrupted_retry_closes_its_entry() {
    let (app, store) = spawn_faulty(1).await;
    let state = &app.state;
    let op = state.tracker.submit("records.flaky", vec![json!({ "id": 1 })]).await.unwrap();

    assert!(fieldsync::worker::process_next(state).await.unwrap());
    assert_eq!(attempts(state, op.id).await, vec![(1, OperationStatus::Pending)]);

    store.progress_faults.store(1, Ordering::SeqCst);
    let err = fieldsync::worker::process_next(state).await.unwrap_err();
    assert!(err.contains("Failed to reset progress"), "{err}");
    assert_eq!(attempts(state, op.id).await, vec![(1, OperationStatus::Failed)]);

    // Recovery logs attempt 2, which succeeds.
    assert_eq!(drain(state).await, 2);

    let op = state.tracker.get(op.id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.retry_count, 2);
    assert_eq!(
        attempts(state, op.id).await,
        vec![(1, OperationStatus::Failed), (2, OperationStatus::Completed)]
    );
    assert_eq!(app.flaky.calls.load(Ordering::SeqCst), 2);
}
