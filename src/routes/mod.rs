pub mod operations;
pub mod procedures;

use axum::Router;
use axum::routing::{get, post};

use crate::state::SharedState;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        // Procedures
        .route("/api/v1/procedures", get(procedures::list))
        .route("/api/v1/procedures/{name}", post(procedures::invoke))
        // Bulk operations
        .route(
            "/api/v1/operations",
            get(operations::list).post(operations::submit),
        )
        .route("/api/v1/operations/{id}", get(operations::get))
        .route("/api/v1/operations/{id}/retries", get(operations::retries))
        .route("/api/v1/operations/{id}/retry", post(operations::manual_retry))
}
