//! Resilient operation delivery for the farm-management platform.
//!
//! Two halves share this crate:
//!
//! * [`client`]: the origin-side queue. User actions are persisted locally,
//!   replayed in order once connectivity returns, and retried with capped
//!   exponential backoff up to a per-action limit.
//! * the server: bulk operations tracked through
//!   `pending -> in_progress -> {completed, failed}`, executed by a worker
//!   pool and re-attempted by the [`retry`] engine, with every attempt kept in
//!   an append-only retry log.
//!
//! Remote procedures are assumed to be idempotent. Neither half deduplicates
//! deliveries beyond never running two drains (client) or two claims of the
//! same retry (server) at once.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod procedures;
pub mod retry;
pub mod routes;
pub mod state;
pub mod store;
pub mod tracker;
pub mod worker;

use std::sync::Arc;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::procedures::ProcedureRegistry;
use crate::procedures::forward::ForwardProcedure;

pub fn build_app(state: state::SharedState) -> Router {
    let max_body_size = state.config.max_body_size;

    Router::new()
        .merge(routes::api_routes())
        .route("/health", axum::routing::get(health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(max_body_size)),
        )
        .with_state(state)
}

/// Registry holding one forwarding procedure per configured route.
pub fn procedures_from_config(config: &Config) -> Result<ProcedureRegistry, String> {
    let mut procedures = ProcedureRegistry::new();
    for (name, url) in &config.procedure_routes {
        let procedure = ForwardProcedure::new(name, url, config.procedure_timeout)
            .map_err(|e| format!("Procedure {name}: {e}"))?;
        procedures.register(Arc::new(procedure));
    }
    if procedures.names().is_empty() {
        tracing::warn!("No procedures configured (FIELDSYNC_PROCEDURE_ROUTES is empty)");
    }
    Ok(procedures)
}

async fn health() -> &'static str {
    "ok"
}
