//! Origin-side delivery: queue actions while offline, replay them when the
//! server is reachable again.

pub mod dispatcher;
pub mod invoker;
pub mod monitor;
pub mod queue;
pub mod record;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use dispatcher::{DispatchError, DispatchPolicy, DrainReport, SyncDispatcher};
pub use invoker::{HttpInvoker, InvokeError, RemoteInvoker};
pub use monitor::{ConnectivityMonitor, ConnectivityProbe, ConnectivityStatus, HttpProbe};
pub use queue::{LoadState, LocalActionStore, QueueError, QueueSnapshot};
pub use record::{ActionKind, ActionRecord, RetryMetadata};
pub use storage::{BlobStorage, FileStorage, MemoryStorage};

use crate::config::ClientConfig;

/// Queue, dispatcher and monitor wired together.
pub struct OfflineClient {
    store: Arc<LocalActionStore>,
    dispatcher: Arc<SyncDispatcher>,
    monitor: Arc<ConnectivityMonitor>,
    probe: Arc<dyn ConnectivityProbe>,
    poll_interval: Duration,
}

impl OfflineClient {
    pub fn new(
        store: Arc<LocalActionStore>,
        invoker: Arc<dyn RemoteInvoker>,
        probe: Arc<dyn ConnectivityProbe>,
        policy: DispatchPolicy,
        poll_interval: Duration,
    ) -> Self {
        let dispatcher = Arc::new(SyncDispatcher::new(store.clone(), invoker, policy));
        let monitor = Arc::new(ConnectivityMonitor::new(store.clone(), dispatcher.clone()));
        Self {
            store,
            dispatcher,
            monitor,
            probe,
            poll_interval,
        }
    }

    /// File-backed queue talking to `config.server_url` over HTTP.
    pub fn from_config(config: &ClientConfig) -> Result<Self, String> {
        let storage = Arc::new(FileStorage::new(config.queue_dir.clone()));
        let store = Arc::new(LocalActionStore::new(storage, &config.queue_key));
        let invoker = HttpInvoker::new(&config.server_url, config.call_timeout)
            .map_err(|e| format!("Failed to create invoker: {e}"))?;
        let probe = HttpProbe::new(&config.server_url, config.call_timeout)
            .map_err(|e| format!("Failed to create health probe: {e}"))?;

        Ok(Self::new(
            store,
            Arc::new(invoker),
            Arc::new(probe),
            DispatchPolicy::from_config(config),
            config.poll_interval,
        ))
    }

    pub fn store(&self) -> &Arc<LocalActionStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<SyncDispatcher> {
        &self.dispatcher
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    /// Queue an action. When online it is sent right away as part of a drain;
    /// either way the returned record is already durable.
    pub async fn submit(
        &self,
        kind: ActionKind,
        procedure: &str,
        payload: serde_json::Value,
        description: Option<String>,
    ) -> Result<ActionRecord, QueueError> {
        let record = self.store.enqueue(kind, procedure, payload, description).await?;

        if self.monitor.is_online() {
            match self.monitor.perform_sync().await {
                Ok(_) | Err(DispatchError::AlreadyDraining) | Err(DispatchError::Offline) => {}
                // The action is stored; the next drain picks it up.
                Err(DispatchError::Queue(e)) => {
                    tracing::error!("Drain after queueing action {} failed: {e}", record.id);
                }
            }
        } else {
            self.monitor.refresh().await;
        }

        Ok(record)
    }

    /// Re-arm an exhausted action. Returns false if it is no longer queued.
    pub async fn retry_failed(&self, id: Uuid) -> Result<bool, QueueError> {
        let reset = self.store.reset_retry_metadata(id).await?.is_some();
        if reset {
            tracing::info!("Action {id} re-armed for delivery");
        }
        self.monitor.refresh().await;
        Ok(reset)
    }

    /// Probe connectivity in the background until `shutdown` flips.
    pub fn spawn_monitor(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = self.monitor.clone();
        let probe = self.probe.clone();
        let interval = self.poll_interval;
        tokio::spawn(async move { monitor.run(probe, interval, shutdown).await })
    }
}
