use std::io;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::record::{ActionKind, ActionRecord, RetryMetadata};
use super::storage::BlobStorage;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to persist action queue: {0}")]
    Storage(#[from] io::Error),
    #[error("failed to encode action queue: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where a loaded queue came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    /// Nothing has been stored yet.
    Empty,
    Stored,
    /// The blob could not be read or decoded; the queue is treated as empty.
    Unreadable(String),
}

#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub records: Vec<ActionRecord>,
    pub state: LoadState,
}

/// Durable FIFO of actions waiting to reach the server.
///
/// The whole queue lives in one blob. Every mutation re-reads, edits and
/// rewrites that blob while holding `lock`, so concurrent callers inside the
/// process never lose each other's writes. A corrupt blob degrades to an
/// empty queue instead of failing the caller.
pub struct LocalActionStore {
    storage: Arc<dyn BlobStorage>,
    key: String,
    lock: Mutex<()>,
}

impl LocalActionStore {
    pub fn new(storage: Arc<dyn BlobStorage>, key: &str) -> Self {
        Self {
            storage,
            key: key.to_string(),
            lock: Mutex::new(()),
        }
    }

    /// All queued records plus how the blob looked when read.
    pub async fn load(&self) -> QueueSnapshot {
        let _guard = self.lock.lock().await;
        self.read_all().await
    }

    pub async fn enqueue(
        &self,
        kind: ActionKind,
        procedure: &str,
        payload: serde_json::Value,
        description: Option<String>,
    ) -> Result<ActionRecord, QueueError> {
        let record = ActionRecord::new(kind, procedure, payload, description);

        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await.records;
        records.push(record.clone());
        self.write_all(&records).await?;

        tracing::debug!("Queued action {} ({})", record.id, record.procedure);
        Ok(record)
    }

    /// No-op when `id` is not queued.
    pub async fn remove(&self, id: Uuid) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await.records;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() != before {
            self.write_all(&records).await?;
        }
        Ok(())
    }

    /// Queued records in insertion order.
    pub async fn list(&self) -> Vec<ActionRecord> {
        self.load().await.records
    }

    pub async fn count(&self) -> usize {
        self.list().await.len()
    }

    /// Set the retry count and stamp `last_retry_time` with now.
    pub async fn update_retry_metadata(
        &self,
        id: Uuid,
        retry_count: u32,
    ) -> Result<Option<ActionRecord>, QueueError> {
        self.set_retry_metadata(
            id,
            Some(RetryMetadata {
                retry_count,
                last_retry_time: Utc::now(),
            }),
        )
        .await
    }

    /// Re-arm an action that ran out of retries.
    pub async fn reset_retry_metadata(&self, id: Uuid) -> Result<Option<ActionRecord>, QueueError> {
        self.set_retry_metadata(id, None).await
    }

    /// Actions still under the retry cap, in queue order.
    pub async fn retryable_actions(&self, max_retries: u32) -> Vec<ActionRecord> {
        self.list()
            .await
            .into_iter()
            .filter(|r| !r.has_exceeded_max_retries(max_retries))
            .collect()
    }

    /// Actions that hit the retry cap and wait for manual intervention.
    pub async fn failed_actions(&self, max_retries: u32) -> Vec<ActionRecord> {
        self.list()
            .await
            .into_iter()
            .filter(|r| r.has_exceeded_max_retries(max_retries))
            .collect()
    }

    pub async fn clear(&self) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        self.storage.delete(&self.key).await?;
        tracing::info!("Action queue cleared");
        Ok(())
    }

    async fn set_retry_metadata(
        &self,
        id: Uuid,
        metadata: Option<RetryMetadata>,
    ) -> Result<Option<ActionRecord>, QueueError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await.records;

        let Some(record) = records.iter_mut().find(|r| r.id == id) else {
            return Ok(None);
        };
        record.retry_metadata = metadata;
        let updated = record.clone();

        self.write_all(&records).await?;
        Ok(Some(updated))
    }

    async fn read_all(&self) -> QueueSnapshot {
        let bytes = match self.storage.read(&self.key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                return QueueSnapshot {
                    records: Vec::new(),
                    state: LoadState::Empty,
                };
            }
            Err(e) => return self.unreadable(format!("read failed: {e}")),
        };

        match serde_json::from_slice::<Vec<ActionRecord>>(&bytes) {
            Ok(records) => QueueSnapshot {
                records,
                state: LoadState::Stored,
            },
            Err(e) => self.unreadable(format!("decode failed: {e}")),
        }
    }

    fn unreadable(&self, reason: String) -> QueueSnapshot {
        tracing::warn!("Action queue '{}' is unreadable, treating as empty: {reason}", self.key);
        QueueSnapshot {
            records: Vec::new(),
            state: LoadState::Unreadable(reason),
        }
    }

    async fn write_all(&self, records: &[ActionRecord]) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec(records)?;
        self.storage.write(&self.key, &bytes).await?;
        Ok(())
    }
}
