use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::api;
use crate::state::AppState;
use std::sync::Arc;

/// Health, status, call creation and administration routes
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(api::health_check))
        .route("/health", get(api::health_details))
        .route("/status", get(api::relay_status))
        .route("/chat/start", post(api::start_chat))
        .route("/clear-connections", post(api::clear_connections))
        .layer(TraceLayer::new_for_http())
}
