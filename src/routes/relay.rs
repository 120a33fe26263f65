//! Device WebSocket routes
//!
//! - `GET /ws/{call_id}`: relay session. The session creates a provider call on
//!   connect, or waits for `connect_to_vapi` when the upstream mode is
//!   `client_supplied`.
//! - `GET /observe[?call_id=<relay>]`: AR observer. Pinches and AR events are
//!   validated and fed into the target relay's conversation (or the first relay
//!   with a provider attached).
//!
//! Connection limits are layered on in `server::build_router`, where the state is available.

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::{observer_handler, relay_handler};
use crate::state::AppState;
use std::sync::Arc;

pub fn create_relay_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws/{call_id}", get(relay_handler))
        .route("/observe", get(observer_handler))
        .layer(TraceLayer::new_for_http())
}
