//! Base types for reaching the voice provider.
//!
//! A relay session obtains its provider channel through an
//! [`UpstreamConnector`]: either by requesting a new call over HTTP and opening
//! the returned WebSocket URL, or by opening a URL supplied by the device.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::messages::{ProviderCommand, ProviderFrame};

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised while requesting a call or running the provider channel.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// API key or assistant id missing
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Call-creation request could not be sent or its body could not be read
    #[error("Call request failed: {0}")]
    RequestFailed(String),

    /// Call-creation answered with something other than 201
    #[error("Failed to create call: {status}")]
    CallRejected { status: u16, body: String },

    /// 201 response without a usable websocket URL or id
    #[error("Invalid call response: {0}")]
    InvalidResponse(String),

    /// WebSocket handshake failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The channel is gone
    #[error("Not connected")]
    NotConnected,
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

// =============================================================================
// Call and channel types
// =============================================================================

/// A call created through the provider's HTTP API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub id: String,
    pub websocket_call_url: String,
}

/// How the upstream channel is located.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamTarget {
    /// Request a new call and open its websocket URL.
    CreateCall,
    /// Open a URL supplied by the device.
    Url(String),
}

/// An open provider channel.
///
/// `commands` feeds the writer; `frames` yields what the provider sends and
/// ends when the socket closes. Dropping `commands` closes the socket.
pub struct ProviderChannel {
    pub call_id: Option<String>,
    pub commands: mpsc::Sender<ProviderCommand>,
    pub frames: mpsc::Receiver<ProviderFrame>,
    /// Socket pump; aborted on teardown.
    pub task: Option<JoinHandle<()>>,
}

impl ProviderChannel {
    /// Channel backed by plain mpsc queues, for in-process providers.
    pub fn from_parts(
        call_id: Option<String>,
        commands: mpsc::Sender<ProviderCommand>,
        frames: mpsc::Receiver<ProviderFrame>,
    ) -> Self {
        Self {
            call_id,
            commands,
            frames,
            task: None,
        }
    }
}

impl fmt::Debug for ProviderChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderChannel")
            .field("call_id", &self.call_id)
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

// =============================================================================
// Connector trait
// =============================================================================

/// Opens provider channels for relay sessions.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn open(&self, target: UpstreamTarget) -> ProviderResult<ProviderChannel>;
}

pub type SharedConnector = Arc<dyn UpstreamConnector>;
