use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use super::dispatcher::{DispatchError, DrainReport, SyncDispatcher};
use super::queue::LocalActionStore;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectivityStatus {
    pub online: bool,
    /// Everything still queued, exhausted actions included.
    pub pending_count: usize,
    /// Queued actions that reached the retry cap.
    pub failed_count: usize,
    pub syncing: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Treats a 2xx from `GET {server}/health` as online.
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: format!("{}/health", server_url.trim_end_matches('/')),
            client,
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn is_reachable(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!("Health probe failed: {e}");
                false
            }
        }
    }
}

/// Tracks whether the server is reachable and kicks off a drain whenever it
/// comes back.
pub struct ConnectivityMonitor {
    store: Arc<LocalActionStore>,
    dispatcher: Arc<SyncDispatcher>,
    status: watch::Sender<ConnectivityStatus>,
}

impl ConnectivityMonitor {
    /// Starts offline until told otherwise.
    pub fn new(store: Arc<LocalActionStore>, dispatcher: Arc<SyncDispatcher>) -> Self {
        let (status, _) = watch::channel(ConnectivityStatus::default());
        Self {
            store,
            dispatcher,
            status,
        }
    }

    pub fn status(&self) -> ConnectivityStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
        self.status.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.status.borrow().online
    }

    /// Record a connectivity change. Going from offline to online drains the
    /// queue and returns the report.
    pub async fn set_online(&self, online: bool) -> Result<Option<DrainReport>, DispatchError> {
        let was_online = self.status.borrow().online;
        self.status.send_modify(|s| s.online = online);

        match (was_online, online) {
            (false, true) => {
                tracing::info!("Connectivity restored");
                self.perform_sync().await.map(Some)
            }
            (true, false) => {
                tracing::info!("Connectivity lost");
                self.refresh().await;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Recount the queue.
    pub async fn refresh(&self) -> ConnectivityStatus {
        let (pending_count, failed_count) = self.counts().await;
        self.status.send_modify(|s| {
            s.pending_count = pending_count;
            s.failed_count = failed_count;
        });
        self.status()
    }

    pub async fn perform_sync(&self) -> Result<DrainReport, DispatchError> {
        if !self.is_online() {
            return Err(DispatchError::Offline);
        }

        self.status.send_modify(|s| s.syncing = true);
        let result = self.dispatcher.drain().await;
        let (pending_count, failed_count) = self.counts().await;
        let syncing = self.dispatcher.is_draining();

        self.status.send_modify(|s| {
            s.pending_count = pending_count;
            s.failed_count = failed_count;
            s.syncing = syncing;
            if result.is_ok() {
                s.last_sync_at = Some(Utc::now());
            }
        });
        result
    }

    /// Probe every `interval` until `shutdown` flips, draining while the
    /// server is reachable and retryable work remains.
    pub async fn run(
        &self,
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::debug!("Connectivity monitor started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let online = probe.is_reachable().await;
            let outcome = match self.set_online(online).await {
                Ok(None) if online => {
                    let status = self.refresh().await;
                    if status.pending_count > status.failed_count {
                        self.perform_sync().await.map(Some)
                    } else {
                        Ok(None)
                    }
                }
                other => other,
            };

            match outcome {
                Ok(_) | Err(DispatchError::AlreadyDraining) => {}
                Err(e) => tracing::error!("Sync failed: {e}"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        tracing::debug!("Connectivity monitor stopped");
    }

    async fn counts(&self) -> (usize, usize) {
        let max_retries = self.dispatcher.policy().max_retries;
        let records = self.store.list().await;
        let failed = records
            .iter()
            .filter(|r| r.has_exceeded_max_retries(max_retries))
            .count();
        (records.len(), failed)
    }
}
