pub mod forward;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ProcedureError {
    pub message: String,
}

impl From<String> for ProcedureError {
    fn from(message: String) -> Self {
        ProcedureError { message }
    }
}

impl From<&str> for ProcedureError {
    fn from(s: &str) -> Self {
        ProcedureError {
            message: s.to_string(),
        }
    }
}

/// A remote operation the delivery core can execute on behalf of a client.
///
/// Implementations must be idempotent: queued actions and bulk items are
/// re-sent after any failure, including ones where the first call actually
/// went through.
#[async_trait]
pub trait Procedure: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, _payload: &serde_json::Value) -> Result<(), ProcedureError> {
        Ok(())
    }

    async fn execute(&self, payload: &serde_json::Value) -> Result<serde_json::Value, ProcedureError>;
}

#[derive(Default, Clone)]
pub struct ProcedureRegistry {
    procedures: BTreeMap<String, Arc<dyn Procedure>>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, procedure: Arc<dyn Procedure>) {
        self.procedures.insert(procedure.name().to_string(), procedure);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Procedure>> {
        self.procedures.get(name)
    }

    /// Names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.procedures.keys().map(String::as_str).collect()
    }
}
