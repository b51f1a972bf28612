//! API layer -- axum routes, handlers, shared state.

mod routes;
pub mod state;

use axum::routing::{delete, get, post};
use axum::Router;

pub use state::AppState;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/ingest", post(routes::ingest))
        .route("/rules", get(routes::list_rules).post(routes::create_rule))
        .route("/rules/{id}", delete(routes::delete_rule))
        .route("/alerts", get(routes::list_alerts))
        .route("/metrics/recent", get(routes::recent_metrics))
        .fallback(fallback)
        .with_state(state)
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}
