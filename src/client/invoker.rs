use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("server rejected call ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("call timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

/// The remote side of a queued action.
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    async fn invoke(
        &self,
        procedure: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, InvokeError>;
}

#[derive(Deserialize)]
struct InvokeResponse {
    result: serde_json::Value,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Calls `POST {server}/api/v1/procedures/{name}` on a fieldsync server.
pub struct HttpInvoker {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpInvoker {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self, InvokeError> {
        let base_url = Url::parse(server_url)
            .map_err(|e| InvokeError::Transport(format!("Invalid server URL {server_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(InvokeError::Transport(format!("Invalid server URL {server_url}")));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InvokeError::Transport(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { base_url, client })
    }

    /// The procedure name is a single percent-encoded path segment.
    fn procedure_url(&self, procedure: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["api", "v1", "procedures", procedure]);
        }
        url
    }
}

#[async_trait]
impl RemoteInvoker for HttpInvoker {
    async fn invoke(
        &self,
        procedure: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, InvokeError> {
        let resp = self
            .client
            .post(self.procedure_url(procedure))
            .json(payload)
            .send()
            .await
            .map_err(|e| InvokeError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|e| e.error)
                .unwrap_or(text);
            return Err(InvokeError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: InvokeResponse = resp
            .json()
            .await
            .map_err(|e| InvokeError::Transport(format!("invalid response body: {e}")))?;
        Ok(body.result)
    }
}
