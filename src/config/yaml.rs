use serde::Deserialize;
use std::path::PathBuf;

use crate::core::training::MatchMode;
use crate::session::{AudioDelivery, UpstreamMode};

/// Shape of the `--config` file. Every key is optional; anything omitted
/// keeps its environment or default value.
///
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 8000
///   tls:
///     enabled: true
///     cert_path: "/etc/voicelink/cert.pem"
///     key_path: "/etc/voicelink/key.pem"
///
/// provider:
///   api_key: "your-vapi-key"
///   assistant_id: "your-assistant-id"
///   base_url: "https://api.vapi.ai"
///   transport: "vapi.websocket"
///   connect_timeout_seconds: 30
///   allow_insecure_upstream: false
///
/// relay:
///   keepalive_interval_seconds: 20
///   sample_rate: 16000
///   lead_time_ms: 50
///   turn_idle_timeout_ms: 1500
///   audio_delivery: json
///   upstream: create_call
///   max_message_bytes: 1048576
///
/// training:
///   scenario_path: "/etc/voicelink/fire_drill.yaml"
///   match_mode: substring
///   strip_punctuation: true
///
/// security:
///   cors_allowed_origins: "*"
///   rate_limit_requests_per_second: 60
///   rate_limit_burst_size: 10
///   max_websocket_connections: 500
///   max_connections_per_ip: 100
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub provider: Option<ProviderYaml>,
    pub relay: Option<RelayYaml>,
    pub training: Option<TrainingYaml>,
    pub security: Option<SecurityYaml>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsYaml>,
}

/// `enabled: false` switches TLS off even when the environment enables it.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsYaml {
    pub enabled: Option<bool>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// Voice provider access from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProviderYaml {
    pub api_key: Option<String>,
    pub assistant_id: Option<String>,
    pub base_url: Option<String>,
    pub transport: Option<String>,
    pub connect_timeout_seconds: Option<u64>,
    pub allow_insecure_upstream: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RelayYaml {
    pub keepalive_interval_seconds: Option<u64>,
    pub sample_rate: Option<u32>,
    pub lead_time_ms: Option<u64>,
    pub turn_idle_timeout_ms: Option<u64>,
    pub audio_delivery: Option<AudioDelivery>,
    pub upstream: Option<UpstreamMode>,
    pub max_message_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TrainingYaml {
    pub scenario_path: Option<String>,
    pub match_mode: Option<MatchMode>,
    pub strip_punctuation: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    pub cors_allowed_origins: Option<String>,
    pub rate_limit_requests_per_second: Option<u32>,
    pub rate_limit_burst_size: Option<u32>,
    pub max_websocket_connections: Option<usize>,
    pub max_connections_per_ip: Option<u32>,
}

impl YamlConfig {
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}
