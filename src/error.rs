use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::procedures::ProcedureError;
use crate::store::StoreError;
use crate::tracker::TrackerError;

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    ProcedureFailed(String),
    Store(StoreError),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::NotFound(msg) => write!(f, "Not Found: {msg}"),
            AppError::BadRequest(msg) => write!(f, "Bad Request: {msg}"),
            AppError::Conflict(msg) => write!(f, "Conflict: {msg}"),
            AppError::ProcedureFailed(msg) => write!(f, "Procedure Failed: {msg}"),
            AppError::Store(err) => write!(f, "Store Error: {err}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::ProcedureFailed(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Store(StoreError::Conflict(msg)) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Store(err) => {
                tracing::error!("Store error: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Store(err)
    }
}

impl From<TrackerError> for AppError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::NotFound(_) => AppError::NotFound("Operation not found".to_string()),
            TrackerError::InvalidState { .. } => AppError::Conflict(err.to_string()),
            TrackerError::Store(e) => AppError::Store(e),
        }
    }
}

impl From<ProcedureError> for AppError {
    fn from(err: ProcedureError) -> Self {
        AppError::ProcedureFailed(err.message)
    }
}
