use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use super::invoker::{InvokeError, RemoteInvoker};
use super::queue::{LocalActionStore, QueueError};
use super::record::ActionRecord;
use crate::config::ClientConfig;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("a drain is already in progress")]
    AlreadyDraining,
    #[error("server is unreachable")]
    Offline,
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Per-action retry limits for the client queue.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
}

impl DispatchPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            max_delay: config.max_delay,
            call_timeout: config.call_timeout,
        }
    }

    /// `min(retry_delay * 2^retry_count, max_delay)`
    pub fn backoff(&self, retry_count: u32) -> Duration {
        self.retry_delay
            .saturating_mul(2u32.saturating_pow(retry_count))
            .min(self.max_delay)
    }

    /// A record that was never retried is always due.
    pub fn is_due(&self, record: &ActionRecord, now: DateTime<Utc>) -> bool {
        let Some(last_retry) = record.last_retry_time() else {
            return true;
        };
        chrono::Duration::from_std(self.backoff(record.retry_count()))
            .ok()
            .and_then(|delay| last_retry.checked_add_signed(delay))
            .is_some_and(|due_at| now >= due_at)
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// Outcome of one pass over the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    /// Skipped because they hit the retry cap.
    pub exhausted: usize,
    /// Skipped because their backoff has not elapsed.
    pub deferred: usize,
}

/// Replays queued actions against the server, oldest first.
pub struct SyncDispatcher {
    store: Arc<LocalActionStore>,
    invoker: Arc<dyn RemoteInvoker>,
    policy: DispatchPolicy,
    draining: Mutex<()>,
}

impl SyncDispatcher {
    pub fn new(
        store: Arc<LocalActionStore>,
        invoker: Arc<dyn RemoteInvoker>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            store,
            invoker,
            policy,
            draining: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    pub fn is_draining(&self) -> bool {
        self.draining.try_lock().is_err()
    }

    /// Deliver every due action once. Delivered actions leave the queue;
    /// failed ones get their retry count bumped and stay in place.
    pub async fn drain(&self) -> Result<DrainReport, DispatchError> {
        let Ok(_guard) = self.draining.try_lock() else {
            return Err(DispatchError::AlreadyDraining);
        };

        let records = self.store.list().await;
        let now = Utc::now();
        let mut report = DrainReport::default();

        for record in records {
            if record.has_exceeded_max_retries(self.policy.max_retries) {
                report.exhausted += 1;
                continue;
            }
            if !self.policy.is_due(&record, now) {
                report.deferred += 1;
                continue;
            }

            match self.deliver(&record).await {
                Ok(()) => {
                    self.store.remove(record.id).await?;
                    report.delivered += 1;
                    tracing::debug!("Delivered action {} ({})", record.id, record.procedure);
                }
                Err(e) => {
                    let retry_count = record.retry_count() + 1;
                    self.store.update_retry_metadata(record.id, retry_count).await?;
                    report.failed += 1;

                    if retry_count >= self.policy.max_retries {
                        tracing::error!(
                            "Action {} ({}) gave up after {retry_count} retries: {e}",
                            record.id,
                            record.procedure
                        );
                    } else {
                        tracing::warn!(
                            "Action {} ({}) failed, retry {retry_count}/{}: {e}",
                            record.id,
                            record.procedure,
                            self.policy.max_retries
                        );
                    }
                }
            }
        }

        if report.delivered + report.failed > 0 {
            tracing::info!(
                "Drain finished: {} delivered, {} failed, {} deferred, {} exhausted",
                report.delivered,
                report.failed,
                report.deferred,
                report.exhausted
            );
        }
        Ok(report)
    }

    async fn deliver(&self, record: &ActionRecord) -> Result<(), InvokeError> {
        let call = self.invoker.invoke(&record.procedure, &record.payload);
        match tokio::time::timeout(self.policy.call_timeout, call).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(InvokeError::Timeout(self.policy.call_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::client::record::{ActionKind, RetryMetadata};
    use crate::client::storage::MemoryStorage;

    /// Fails each procedure a fixed number of times, then succeeds.
    #[derive(Default)]
    struct FlakyInvoker {
        failures: std::sync::Mutex<HashMap<String, u32>>,
        calls: std::sync::Mutex<Vec<String>>,
    }

    impl FlakyInvoker {
        fn failing(procedure: &str, times: u32) -> Self {
            let invoker = Self::default();
            invoker.failures.lock().unwrap().insert(procedure.to_string(), times);
            invoker
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteInvoker for FlakyInvoker {
        async fn invoke(
            &self,
            procedure: &str,
            _payload: &serde_json::Value,
        ) -> Result<serde_json::Value, InvokeError> {
            self.calls.lock().unwrap().push(procedure.to_string());
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(procedure) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Err(InvokeError::Rejected {
                        status: 503,
                        message: "unavailable".to_string(),
                    })
                }
                _ => Ok(json!({ "ok": true })),
            }
        }
    }

    /// Blocks every call until released.
    struct GatedInvoker {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl RemoteInvoker for GatedInvoker {
        async fn invoke(
            &self,
            _procedure: &str,
            _payload: &serde_json::Value,
        ) -> Result<serde_json::Value, InvokeError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(json!(null))
        }
    }

    fn instant_policy() -> DispatchPolicy {
        DispatchPolicy {
            retry_delay: Duration::ZERO,
            ..DispatchPolicy::default()
        }
    }

    fn queue() -> Arc<LocalActionStore> {
        Arc::new(LocalActionStore::new(Arc::new(MemoryStorage::new()), "offline-actions"))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = DispatchPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(1), Duration::from_millis(4_000));
        assert_eq!(policy.backoff(2), Duration::from_millis(8_000));
        assert_eq!(policy.backoff(20), Duration::from_millis(300_000));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_millis(300_000));
    }

    #[test]
    fn due_after_backoff_elapses() {
        let policy = DispatchPolicy::default();
        let mut record = ActionRecord::new(ActionKind::Mutation, "a", json!({}), None);
        let now = Utc::now();
        assert!(policy.is_due(&record, now));

        record.retry_metadata = Some(RetryMetadata {
            retry_count: 1,
            last_retry_time: now,
        });
        assert!(!policy.is_due(&record, now + chrono::Duration::milliseconds(3_999)));
        assert!(policy.is_due(&record, now + chrono::Duration::milliseconds(4_000)));
    }

    #[tokio::test]
    async fn delivered_actions_leave_the_queue_in_order() {
        let store = queue();
        for name in ["first", "second", "third"] {
            store.enqueue(ActionKind::Mutation, name, json!({}), None).await.unwrap();
        }
        let invoker = Arc::new(FlakyInvoker::default());
        let dispatcher = SyncDispatcher::new(store.clone(), invoker.clone(), instant_policy());

        let report = dispatcher.drain().await.unwrap();

        assert_eq!(report.delivered, 3);
        assert_eq!(invoker.calls(), vec!["first", "second", "third"]);
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn failure_bumps_retry_count_and_keeps_the_action() {
        let store = queue();
        let queued = store.enqueue(ActionKind::DataUpdate, "crops.update", json!({}), None).await.unwrap();
        let invoker = Arc::new(FlakyInvoker::failing("crops.update", 1));
        let dispatcher = SyncDispatcher::new(store.clone(), invoker, instant_policy());

        let report = dispatcher.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        let listed = store.list().await;
        assert_eq!(listed[0].id, queued.id);
        assert_eq!(listed[0].retry_count(), 1);

        let report = dispatcher.drain().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn exhausted_actions_are_never_sent() {
        let store = queue();
        store.enqueue(ActionKind::Mutation, "expenses.create", json!({}), None).await.unwrap();
        let invoker = Arc::new(FlakyInvoker::failing("expenses.create", u32::MAX));
        let dispatcher = SyncDispatcher::new(store.clone(), invoker.clone(), instant_policy());

        for _ in 0..3 {
            dispatcher.drain().await.unwrap();
        }
        assert_eq!(invoker.calls().len(), 3);

        let report = dispatcher.drain().await.unwrap();
        assert_eq!(report.exhausted, 1);
        assert_eq!(invoker.calls().len(), 3);
        assert_eq!(store.failed_actions(3).await.len(), 1);
    }

    #[tokio::test]
    async fn backoff_defers_the_next_attempt() {
        let store = queue();
        store.enqueue(ActionKind::Mutation, "animals.move", json!({}), None).await.unwrap();
        let invoker = Arc::new(FlakyInvoker::failing("animals.move", 1));
        let dispatcher = SyncDispatcher::new(store.clone(), invoker.clone(), DispatchPolicy::default());

        dispatcher.drain().await.unwrap();
        let report = dispatcher.drain().await.unwrap();

        assert_eq!(report.deferred, 1);
        assert_eq!(invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out_as_failures() {
        let store = queue();
        store.enqueue(ActionKind::Mutation, "slow", json!({}), None).await.unwrap();
        let invoker = Arc::new(GatedInvoker {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let policy = DispatchPolicy {
            call_timeout: Duration::from_millis(20),
            ..instant_policy()
        };
        let dispatcher = SyncDispatcher::new(store.clone(), invoker, policy);

        let report = dispatcher.drain().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(store.list().await[0].retry_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_drain_is_rejected() {
        let store = queue();
        store.enqueue(ActionKind::Mutation, "a", json!({}), None).await.unwrap();
        let invoker = Arc::new(GatedInvoker {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let dispatcher = Arc::new(SyncDispatcher::new(store.clone(), invoker.clone(), instant_policy()));

        let first = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.drain().await }
        });
        invoker.entered.notified().await;

        assert!(dispatcher.is_draining());
        assert!(matches!(dispatcher.drain().await, Err(DispatchError::AlreadyDraining)));

        invoker.release.notify_one();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.delivered, 1);
        assert!(!dispatcher.is_draining());
    }
}
