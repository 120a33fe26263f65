pub mod config;
pub mod core;
pub mod errors;
pub mod handlers;
pub mod harness;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod session;
pub mod state;
pub mod utils;

// Re-export commonly used items for convenience
pub use config::ServerConfig;
pub use core::*;
pub use errors::{RelayError, RelayResult};
pub use session::{RelayPolicy, RelaySession, SessionRegistry};
pub use state::AppState;
