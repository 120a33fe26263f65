//! Voice-provider access: call creation over HTTP and the bidirectional
//! audio/control WebSocket channel.
//!
//! # Audio Format
//!
//! PCM 16-bit signed little-endian, mono, 16 kHz in both directions.

mod base;
mod client;
mod messages;
mod websocket;

pub use base::{
    ProviderCall, ProviderChannel, ProviderError, ProviderResult, SharedConnector,
    UpstreamConnector, UpstreamTarget,
};
pub use client::{CallClient, CallClientConfig, DEFAULT_BASE_URL, DEFAULT_TRANSPORT};
pub use messages::{
    ConversationMessage, MessageRole, ProviderCommand, ProviderEvent, ProviderFrame,
    ProviderOutbound, SpeechStatus,
};
pub use websocket::{CHANNEL_CAPACITY, WebSocketConnector};
