//! HTTP and WebSocket request handlers
//!
//! - `api` - health, relay status and connection clearing
//! - `relay` - device relay and AR observer WebSockets

pub mod api;
pub mod relay;

pub use relay::{observer_handler, relay_handler};
