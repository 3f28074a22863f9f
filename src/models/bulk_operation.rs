use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state shared by bulk operations and retry log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "in_progress" | "in-progress" => Ok(OperationStatus::InProgress),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(format!("Unknown operation status: {other}")),
        }
    }
}

impl TryFrom<String> for OperationStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BulkOperation {
    pub id: Uuid,
    #[sqlx(rename = "procedure_name")]
    pub procedure: String,
    /// JSON array, one payload per item.
    pub items: serde_json::Value,
    #[sqlx(try_from = "String")]
    pub status: OperationStatus,
    pub total_items: i32,
    pub processed_items: i32,
    pub success_count: i32,
    pub failure_count: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BulkOperation {
    pub fn item_payloads(&self) -> Vec<serde_json::Value> {
        self.items.as_array().cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct NewBulkOperation {
    pub procedure: String,
    pub items: Vec<serde_json::Value>,
    pub max_retries: i32,
}

/// Absolute progress counters for the attempt currently running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub processed_items: i32,
    pub success_count: i32,
    pub failure_count: i32,
}
