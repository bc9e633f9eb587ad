//! HTTP wrapper around the SPECTER2 query embedder.
//!
//! Provides:
//! - `GET /health` liveness probe
//! - `POST /embed` query embedding

pub mod handlers;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

pub use handlers::AppState;

/// Build the service router around an already-loaded embedder.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/embed", post(handlers::embed))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
