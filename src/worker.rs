use tokio::sync::watch;
use uuid::Uuid;

use crate::models::{BulkOperation, Progress};
use crate::retry::{RetryDecision, RetryError};
use crate::state::SharedState;

/// How many runnable operations a worker looks at per poll.
const CLAIM_BATCH: i64 = 10;

/// Start a worker pool on a dedicated Tokio runtime with its own thread pool.
/// This runs on a separate OS thread and blocks until shutdown is signaled.
pub fn run_pool(
    state: SharedState,
    shutdown: watch::Receiver<bool>,
    worker_count: usize,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_count)
        .thread_name("retry-worker")
        .enable_all()
        .build()?;

    std::thread::Builder::new()
        .name("worker-pool".into())
        .spawn(move || {
            runtime.block_on(async {
                let mut handles = Vec::with_capacity(worker_count);

                for id in 0..worker_count {
                    handles.push(tokio::spawn(run(id, state.clone(), shutdown.clone())));
                }

                tracing::info!("Retry worker pool started ({worker_count} workers)");

                for handle in handles {
                    let _ = handle.await;
                }

                tracing::info!("Retry worker pool stopped");
            });
        })
}

/// A single worker loop that polls for due work and processes it.
async fn run(id: usize, state: SharedState, mut shutdown: watch::Receiver<bool>) {
    tracing::debug!("Worker {id} started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match process_next(&state).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                tracing::error!("Worker {id} error: {e}");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(state.config.poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }

    tracing::debug!("Worker {id} stopped");
}

/// Claim and execute one unit of work: a due retry first, otherwise a fresh
/// pending operation, otherwise reschedule an orphaned failure. Returns true
/// if something was processed.
pub async fn process_next(state: &SharedState) -> Result<bool, String> {
    if let Some(operation) = claim_due_retry(state).await? {
        execute(state, operation).await?;
        return Ok(true);
    }

    if let Some(operation) = claim_runnable(state).await? {
        execute(state, operation).await?;
        return Ok(true);
    }

    recover_orphan(state).await
}

async fn claim_due_retry(state: &SharedState) -> Result<Option<BulkOperation>, String> {
    let due = state
        .engine
        .pending_retries()
        .await
        .map_err(|e| format!("Failed to load pending retries: {e}"))?;

    for candidate in due {
        let entry = match state.engine.claim(candidate.id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => continue,
            Err(e) => return Err(format!("Failed to claim retry {}: {e}", candidate.id)),
        };

        tracing::debug!(
            "Claimed retry {} (operation={}, attempt={})",
            entry.id,
            entry.operation_id,
            entry.retry_attempt
        );

        match state.tracker.mark_in_progress(entry.operation_id).await {
            Ok(Some(operation)) => return Ok(Some(operation)),
            Ok(None) => {
                let reason = "Operation was not retryable when its retry came due";
                tracing::warn!("Retry {}: {reason}", entry.id);
                abandon(state, entry.id, reason).await;
            }
            Err(e) => {
                abandon(state, entry.id, &e.to_string()).await;
                return Err(format!("Failed to start operation {}: {e}", entry.operation_id));
            }
        }
    }

    Ok(None)
}

async fn abandon(state: &SharedState, entry_id: Uuid, reason: &str) {
    if let Err(e) = state.engine.abandon(entry_id, reason).await {
        tracing::error!("Failed to abandon retry {entry_id}: {e}");
    }
}

async fn claim_runnable(state: &SharedState) -> Result<Option<BulkOperation>, String> {
    let candidates = state
        .store
        .runnable_operations(CLAIM_BATCH)
        .await
        .map_err(|e| format!("Failed to load pending operations: {e}"))?;

    for candidate in candidates {
        if let Some(operation) = state
            .tracker
            .mark_in_progress(candidate.id)
            .await
            .map_err(|e| format!("Failed to claim operation {}: {e}", candidate.id))?
        {
            return Ok(Some(operation));
        }
    }

    Ok(None)
}

/// Log the missing next attempt of one failed operation whose worker was
/// interrupted before it could do so.
async fn recover_orphan(state: &SharedState) -> Result<bool, String> {
    let orphans = state
        .store
        .orphaned_operations(CLAIM_BATCH)
        .await
        .map_err(|e| format!("Failed to load orphaned operations: {e}"))?;

    for operation in orphans {
        let error = operation
            .error_message
            .as_deref()
            .unwrap_or("Attempt interrupted");
        match state.engine.handle_failure(operation.id, error).await {
            Ok(decision) => {
                tracing::info!("Recovered orphaned operation {} ({decision:?})", operation.id);
                return Ok(true);
            }
            // Another worker recovered it first.
            Err(RetryError::Conflict(_)) => continue,
            Err(e) => return Err(format!("Failed to recover operation {}: {e}", operation.id)),
        }
    }

    Ok(false)
}

/// Run every item through the operation's procedure, then complete it or hand
/// the failure to the retry engine.
async fn execute(state: &SharedState, operation: BulkOperation) -> Result<(), String> {
    tracing::debug!(
        "Executing operation {} ({}, {} items, retry_count={})",
        operation.id,
        operation.procedure,
        operation.total_items,
        operation.retry_count
    );

    let Some(procedure) = state.procedures.get(&operation.procedure) else {
        let error = format!("Unknown procedure: {}", operation.procedure);
        return fail(state, &operation, &error).await;
    };

    let timeout = state.config.procedure_timeout;
    let mut progress = Progress::default();
    let mut last_error = None;

    // Counters are absolute, so the first write also clears the previous attempt's.
    if let Err(e) = state.tracker.record_progress(operation.id, progress).await {
        let error = format!("Failed to reset progress for {}: {e}", operation.id);
        release(state, &operation, &error).await;
        return Err(error);
    }

    for item in operation.item_payloads() {
        match tokio::time::timeout(timeout, procedure.execute(&item)).await {
            Ok(Ok(_)) => progress.success_count += 1,
            Ok(Err(e)) => {
                progress.failure_count += 1;
                last_error = Some(e.message);
            }
            Err(_) => {
                progress.failure_count += 1;
                last_error = Some(format!("timed out after {}s", timeout.as_secs()));
            }
        }
        progress.processed_items += 1;

        if let Err(e) = state.tracker.record_progress(operation.id, progress).await {
            tracing::error!("Failed to record progress for {}: {e}", operation.id);
        }
    }

    match last_error {
        None => match state.tracker.mark_completed(operation.id).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let error = format!("Failed to complete operation {}: {e}", operation.id);
                release(state, &operation, &error).await;
                Err(error)
            }
        },
        Some(last_error) => {
            let error = format!(
                "{} of {} items failed: {last_error}",
                progress.failure_count, progress.processed_items
            );
            fail(state, &operation, &error).await
        }
    }
}

/// Record a failed attempt. Marking the operation failed, closing its active
/// entry and logging the next attempt (or the terminal failure) happen in one
/// store call, so no other worker sees a half-recorded failure.
async fn fail(state: &SharedState, operation: &BulkOperation, error: &str) -> Result<(), String> {
    tracing::warn!("Operation {} failed: {error}", operation.id);

    match state.engine.handle_failure(operation.id, error).await {
        Ok(RetryDecision::Scheduled { attempt, next_retry_at }) => {
            tracing::debug!("Operation {} retry {attempt} due at {next_retry_at}", operation.id);
            Ok(())
        }
        Ok(RetryDecision::Exhausted) => Ok(()),
        Err(e) => {
            release(state, operation, error).await;
            Err(format!("Failed to schedule retry for {}: {e}", operation.id))
        }
    }
}

/// Give the claim back after a store error so the operation is picked up by
/// [`recover_orphan`] instead of staying in progress.
async fn release(state: &SharedState, operation: &BulkOperation, error: &str) {
    match state.tracker.release(operation.id, error).await {
        Ok(Some(_)) => {}
        Ok(None) => tracing::warn!("Operation {} was no longer in progress", operation.id),
        Err(e) => tracing::error!("Failed to release operation {}: {e}", operation.id),
    }
}
