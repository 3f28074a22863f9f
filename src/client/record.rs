use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Mutation,
    FormSubmission,
    DataUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryMetadata {
    pub retry_count: u32,
    pub last_retry_time: DateTime<Utc>,
}

/// One buffered user action awaiting remote execution.
///
/// Immutable once queued, apart from `retry_metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub id: Uuid,
    pub kind: ActionKind,
    pub timestamp: DateTime<Utc>,
    pub procedure: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_metadata: Option<RetryMetadata>,
}

impl ActionRecord {
    pub fn new(
        kind: ActionKind,
        procedure: &str,
        payload: serde_json::Value,
        description: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            timestamp: Utc::now(),
            procedure: procedure.to_string(),
            payload,
            description,
            retry_metadata: None,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_metadata.as_ref().map_or(0, |m| m.retry_count)
    }

    pub fn last_retry_time(&self) -> Option<DateTime<Utc>> {
        self.retry_metadata.as_ref().map(|m| m.last_retry_time)
    }

    pub fn has_exceeded_max_retries(&self, max_retries: u32) -> bool {
        self.retry_count() >= max_retries
    }
}
