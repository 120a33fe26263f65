use thiserror::Error;

use crate::core::provider::ProviderError;
use crate::session::DeviceDecodeError;

/// Failure classes a relay session can hit.
///
/// Only upstream failure and channel closure end a session. Everything else is
/// reported to the device as an `error` message and the session carries on.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Call creation or provider channel establishment failed
    #[error("Failed to connect to Vapi: {0}")]
    UpstreamUnavailable(#[from] ProviderError),

    /// A socket went away; `side` is "device" or "provider"
    #[error("{side} channel closed")]
    ChannelClosed { side: &'static str },

    /// Unparseable or oversized device frame
    #[error(transparent)]
    MalformedMessage(#[from] DeviceDecodeError),

    /// Well-formed request the session cannot honour right now
    #[error("{0}")]
    Rejected(String),

    /// Local output could not keep up; frames were dropped
    #[error("Audio output overrun: {dropped} frames dropped")]
    AudioOverrun { dropped: u64 },
}

impl RelayError {
    pub fn rejected(message: impl Into<String>) -> Self {
        RelayError::Rejected(message.into())
    }

    pub fn device_closed() -> Self {
        RelayError::ChannelClosed { side: "device" }
    }

    pub fn provider_closed() -> Self {
        RelayError::ChannelClosed { side: "provider" }
    }

    /// Whether the error must tear the session down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::UpstreamUnavailable(_) | RelayError::ChannelClosed { .. }
        )
    }
}

/// Result type for relay session operations.
pub type RelayResult<T> = Result<T, RelayError>;
