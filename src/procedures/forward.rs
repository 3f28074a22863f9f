use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{Procedure, ProcedureError};

/// Relays a payload as JSON to the CRUD service that owns the procedure.
pub struct ForwardProcedure {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl ForwardProcedure {
    pub fn new(name: &str, url: &str, timeout: Duration) -> Result<Self, ProcedureError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProcedureError::from(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl Procedure for ForwardProcedure {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, payload: &serde_json::Value) -> Result<(), ProcedureError> {
        if payload.is_null() {
            return Err(ProcedureError::from("payload is required"));
        }
        Ok(())
    }

    async fn execute(&self, payload: &serde_json::Value) -> Result<serde_json::Value, ProcedureError> {
        let resp = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("X-Procedure", &self.name)
            .json(payload)
            .send()
            .await
            .map_err(|e| ProcedureError::from(format!("{} request failed: {e}", self.name)))?;

        let status_code = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(1024)
            .collect::<String>();

        if !(200..300).contains(&status_code) {
            return Err(ProcedureError::from(format!(
                "{} returned {status_code}: {body}",
                self.name
            )));
        }

        let body = serde_json::from_str(&body).unwrap_or(json!(body));
        Ok(json!({
            "status_code": status_code,
            "body": body,
        }))
    }
}
