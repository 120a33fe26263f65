use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::registry::SessionKind;
use crate::config::ServerConfig;
use crate::core::audio::JitterConfig;
use crate::core::training::MatchPolicy;

/// How provider audio reaches the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioDelivery {
    /// `{"type":"audio_chunk","data":<base64>}` text frames.
    #[default]
    Json,
    /// Raw PCM binary frames.
    Binary,
}

impl FromStr for AudioDelivery {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(AudioDelivery::Json),
            "binary" => Ok(AudioDelivery::Binary),
            other => Err(format!(
                "Invalid audio delivery '{other}', expected 'json' or 'binary'"
            )),
        }
    }
}

impl fmt::Display for AudioDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioDelivery::Json => write!(f, "json"),
            AudioDelivery::Binary => write!(f, "binary"),
        }
    }
}

/// How a relay session obtains its provider channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamMode {
    /// Request a call as soon as the device connects.
    #[default]
    CreateCall,
    /// Wait for the device to send `connect_to_vapi`.
    ClientSupplied,
}

impl FromStr for UpstreamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create_call" => Ok(UpstreamMode::CreateCall),
            "client_supplied" => Ok(UpstreamMode::ClientSupplied),
            other => Err(format!(
                "Invalid upstream mode '{other}', expected 'create_call' or 'client_supplied'"
            )),
        }
    }
}

impl fmt::Display for UpstreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamMode::CreateCall => write!(f, "create_call"),
            UpstreamMode::ClientSupplied => write!(f, "client_supplied"),
        }
    }
}

/// Behaviour injected into a [`RelaySession`](super::RelaySession).
///
/// `Relay` sessions carry browser-relayed audio over their own provider
/// channel. `Observer` sessions are AR-event-only: they validate interactions
/// and feed the conversation of `observer_target` (or the oldest relay).
#[derive(Debug, Clone, PartialEq)]
pub struct RelayPolicy {
    pub kind: SessionKind,
    pub upstream: UpstreamMode,
    pub audio_delivery: AudioDelivery,
    pub observer_target: Option<String>,
    pub keepalive_interval: Duration,
    pub connect_timeout: Duration,
    pub allow_insecure_upstream: bool,
    pub jitter: JitterConfig,
    pub match_policy: MatchPolicy,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            kind: SessionKind::Relay,
            upstream: UpstreamMode::CreateCall,
            audio_delivery: AudioDelivery::Json,
            observer_target: None,
            keepalive_interval: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(30),
            allow_insecure_upstream: false,
            jitter: JitterConfig::default(),
            match_policy: MatchPolicy::default(),
        }
    }
}

impl RelayPolicy {
    /// Browser-relayed audio session built from server configuration.
    pub fn relay(config: &ServerConfig) -> Self {
        Self {
            kind: SessionKind::Relay,
            upstream: config.relay.upstream,
            audio_delivery: config.relay.audio_delivery,
            observer_target: None,
            keepalive_interval: config.relay.keepalive_interval,
            connect_timeout: config.provider.connect_timeout,
            allow_insecure_upstream: config.provider.allow_insecure_upstream,
            jitter: config.relay.jitter_config(),
            match_policy: config.training.match_policy(),
        }
    }

    /// AR-event-only session feeding `target`'s conversation.
    pub fn observer(config: &ServerConfig, target: Option<String>) -> Self {
        Self {
            kind: SessionKind::Observer,
            observer_target: target,
            ..Self::relay(config)
        }
    }

    pub fn is_observer(&self) -> bool {
        self.kind == SessionKind::Observer
    }
}
