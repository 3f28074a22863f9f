use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{BulkOperation, OperationStatus, RetryLogEntry};
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct SubmitOperation {
    pub procedure: String,
    pub items: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Serialize)]
pub struct ManualRetryResponse {
    pub operation: BulkOperation,
    pub retry: RetryLogEntry,
}

pub async fn submit(
    State(state): State<SharedState>,
    Json(req): Json<SubmitOperation>,
) -> Result<Json<BulkOperation>, AppError> {
    let procedure = state
        .procedures
        .get(&req.procedure)
        .ok_or_else(|| AppError::BadRequest(format!("Unknown procedure: {}", req.procedure)))?;

    if req.items.is_empty() {
        return Err(AppError::BadRequest("items must not be empty".to_string()));
    }

    for (index, item) in req.items.iter().enumerate() {
        procedure
            .validate(item)
            .map_err(|e| AppError::BadRequest(format!("item {index}: {}", e.message)))?;
    }

    let operation = state.tracker.submit(&req.procedure, req.items).await?;
    Ok(Json(operation))
}

pub async fn list(
    State(state): State<SharedState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<BulkOperation>>, AppError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<OperationStatus>)
        .transpose()
        .map_err(AppError::BadRequest)?;

    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1) * per_page;

    let operations = state.tracker.list(status, per_page, offset).await?;
    Ok(Json(operations))
}

pub async fn get(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BulkOperation>, AppError> {
    let operation = state
        .tracker
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Operation not found".to_string()))?;
    Ok(Json(operation))
}

pub async fn retries(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<RetryLogEntry>>, AppError> {
    state
        .tracker
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Operation not found".to_string()))?;

    let history = state.engine.history(id).await?;
    Ok(Json(history))
}

pub async fn manual_retry(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ManualRetryResponse>, AppError> {
    let (operation, retry) = state.tracker.manual_retry(id).await?;
    Ok(Json(ManualRetryResponse { operation, retry }))
}
