use axum::Json;
use axum::extract::{Path, State};
use serde_json::json;

use crate::error::AppError;
use crate::state::SharedState;

pub async fn list(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!({ "procedures": state.procedures.names() }))
}

/// Synchronous invocation, the target of the client-side dispatcher.
pub async fn invoke(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let procedure = state
        .procedures
        .get(&name)
        .ok_or_else(|| AppError::NotFound(format!("Unknown procedure: {name}")))?;

    procedure
        .validate(&payload)
        .map_err(|e| AppError::BadRequest(e.message))?;

    let result = tokio::time::timeout(state.config.procedure_timeout, procedure.execute(&payload))
        .await
        .map_err(|_| {
            AppError::ProcedureFailed(format!(
                "{name} timed out after {}s",
                state.config.procedure_timeout.as_secs()
            ))
        })??;

    tracing::debug!("Procedure {name} invoked");
    Ok(Json(json!({ "procedure": name, "result": result })))
}
