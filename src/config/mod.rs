//! Gateway configuration.
//!
//! Settings come from four layers, later ones winning: built-in defaults, the
//! `.env` file, process environment variables and an optional YAML file. The
//! loaded configuration is validated once at startup, including parsing the
//! training scenario, so a bad file fails before any socket is opened.
//!
//! ```rust,no_run
//! use voicelink_gateway::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = match std::env::args().nth(1) {
//!     Some(path) => ServerConfig::from_file(&PathBuf::from(path))?,
//!     None => ServerConfig::from_env()?,
//! };
//! println!("relay on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

mod env;
mod merge;
mod utils;
mod validation;
mod yaml;

use crate::core::audio::{DEFAULT_SAMPLE_RATE, JitterConfig};
use crate::core::provider::{CallClientConfig, DEFAULT_BASE_URL, DEFAULT_TRANSPORT};
use crate::core::training::{MatchMode, MatchPolicy, ScenarioError, TrainingScenario};
use crate::session::{AudioDelivery, UpstreamMode};

/// PEM certificate and key; present only when TLS is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Voice provider access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Bearer token for call creation
    pub api_key: Option<String>,
    pub assistant_id: Option<String>,
    pub base_url: String,
    /// `transport.provider` value sent with call creation
    pub transport: String,
    /// Bound on call creation plus channel establishment
    pub connect_timeout: Duration,
    /// Accept `ws://` and private hosts in `connect_to_vapi`
    pub allow_insecure_upstream: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            assistant_id: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            transport: DEFAULT_TRANSPORT.to_string(),
            connect_timeout: Duration::from_secs(30),
            allow_insecure_upstream: false,
        }
    }
}

impl ProviderConfig {
    pub fn call_client_config(&self) -> CallClientConfig {
        CallClientConfig {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            assistant_id: self.assistant_id.clone(),
            transport: self.transport.clone(),
            timeout: self.connect_timeout,
        }
    }
}

/// Per-session relay behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub keepalive_interval: Duration,
    pub sample_rate: u32,
    pub lead_time: Duration,
    pub turn_idle_timeout: Duration,
    pub audio_delivery: AudioDelivery,
    pub upstream: UpstreamMode,
    /// WebSocket frame and message cap on device connections
    pub max_message_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(20),
            sample_rate: DEFAULT_SAMPLE_RATE,
            lead_time: Duration::from_millis(50),
            turn_idle_timeout: Duration::from_millis(1500),
            audio_delivery: AudioDelivery::Json,
            upstream: UpstreamMode::CreateCall,
            max_message_bytes: 1024 * 1024,
        }
    }
}

impl RelayConfig {
    pub fn jitter_config(&self) -> JitterConfig {
        JitterConfig {
            lead_time: self.lead_time,
            turn_idle_timeout: self.turn_idle_timeout,
            sample_rate: self.sample_rate,
        }
    }
}

/// Training scenario selection and object matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingConfig {
    /// YAML scenario file; the built-in fire drill when unset
    pub scenario_path: Option<PathBuf>,
    pub match_mode: MatchMode,
    pub strip_punctuation: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            scenario_path: None,
            match_mode: MatchMode::Substring,
            strip_punctuation: true,
        }
    }
}

impl TrainingConfig {
    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            mode: self.match_mode,
            strip_punctuation: self.strip_punctuation,
        }
    }

    pub fn load_scenario(&self) -> Result<TrainingScenario, ScenarioError> {
        match &self.scenario_path {
            Some(path) => TrainingScenario::from_file(path),
            None => Ok(TrainingScenario::fire_emergency()),
        }
    }
}

/// Everything the relay process needs, grouped by concern.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,

    pub provider: ProviderConfig,
    pub relay: RelayConfig,
    pub training: TrainingConfig,

    /// `*`, a comma-separated origin list, or unset for same-origin only.
    pub cors_allowed_origins: Option<String>,
    /// Handed to the governor limiter; 100000 or more turns it off.
    pub rate_limit_requests_per_second: u32,
    pub rate_limit_burst_size: u32,
    /// Concurrent device sockets across all clients; unset means no cap.
    pub max_websocket_connections: Option<usize>,
    pub max_connections_per_ip: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            tls: None,
            provider: ProviderConfig::default(),
            relay: RelayConfig::default(),
            training: TrainingConfig::default(),
            cors_allowed_origins: None,
            rate_limit_requests_per_second: 60,
            rate_limit_burst_size: 10,
            max_websocket_connections: None,
            max_connections_per_ip: 100,
        }
    }
}

/// Zeroize the provider key when the configuration is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.provider.api_key {
            key.zeroize();
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with the environment. Call after `dotenvy` has run
    /// so `.env` entries are visible.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = env::from_env()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// The environment configuration with every value present in the YAML
    /// file at `path` taking precedence.
    ///
    /// # Errors
    /// Unreadable or malformed YAML, an unparseable environment variable, or
    /// a configuration that fails validation.
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// `host:port` for the listener.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Whether call creation has the credentials it needs.
    pub fn has_provider_credentials(&self) -> bool {
        self.provider.api_key.is_some() && self.provider.assistant_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    const ENV_KEYS: &[&str] = &[
        "HOST",
        "PORT",
        "TLS_ENABLED",
        "TLS_CERT_PATH",
        "TLS_KEY_PATH",
        "VAPI_API_KEY",
        "VAPI_ASSISTANT_ID",
        "VAPI_BASE_URL",
        "VAPI_TRANSPORT",
        "PROVIDER_CONNECT_TIMEOUT_SECONDS",
        "ALLOW_INSECURE_UPSTREAM",
        "KEEPALIVE_INTERVAL_SECONDS",
        "AUDIO_SAMPLE_RATE",
        "PLAYBACK_LEAD_TIME_MS",
        "TURN_IDLE_TIMEOUT_MS",
        "AUDIO_DELIVERY",
        "UPSTREAM_MODE",
        "MAX_DEVICE_MESSAGE_BYTES",
        "TRAINING_SCENARIO_PATH",
        "OBJECT_MATCH_MODE",
        "OBJECT_MATCH_STRIP_PUNCTUATION",
        "CORS_ALLOWED_ORIGINS",
        "RATE_LIMIT_REQUESTS_PER_SECOND",
        "RATE_LIMIT_BURST_SIZE",
        "MAX_WEBSOCKET_CONNECTIONS",
        "MAX_CONNECTIONS_PER_IP",
    ];

    fn cleanup_env_vars() {
        for key in ENV_KEYS {
            unsafe {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_address_and_tls() {
        let mut config = ServerConfig::default();
        config.host = "127.0.0.1".to_string();
        config.port = 9000;
        assert_eq!(config.address(), "127.0.0.1:9000");
        assert!(!config.is_tls_enabled());

        config.tls = Some(TlsConfig {
            cert_path: PathBuf::from("/tmp/cert.pem"),
            key_path: PathBuf::from("/tmp/key.pem"),
        });
        assert!(config.is_tls_enabled());
    }

    #[test]
    fn test_section_helpers() {
        let mut config = ServerConfig::default();
        config.provider.api_key = Some("key".to_string());
        config.provider.assistant_id = Some("assistant".to_string());
        config.relay.lead_time = Duration::from_millis(120);
        config.training.match_mode = MatchMode::Token;

        assert!(config.has_provider_credentials());
        let client = config.provider.call_client_config();
        assert_eq!(client.base_url, DEFAULT_BASE_URL);
        assert_eq!(client.api_key.as_deref(), Some("key"));
        assert_eq!(client.timeout, Duration::from_secs(30));
        assert_eq!(config.relay.jitter_config().lead_time, Duration::from_millis(120));
        assert_eq!(config.training.match_policy().mode, MatchMode::Token);
        assert_eq!(config.training.load_scenario().unwrap().name, "fire_emergency");
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        cleanup_env_vars();

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8000);
        assert_eq!(config.provider.base_url, "https://api.vapi.ai");
        assert_eq!(config.provider.transport, "vapi.websocket");
        assert_eq!(config.relay.keepalive_interval, Duration::from_secs(20));
        assert_eq!(config.relay.audio_delivery, AudioDelivery::Json);
        assert_eq!(config.relay.upstream, UpstreamMode::CreateCall);
        assert_eq!(config.rate_limit_requests_per_second, 60);
        assert_eq!(config.max_connections_per_ip, 100);
        assert!(config.max_websocket_connections.is_none());

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_values() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "9100");
            env::set_var("VAPI_API_KEY", "env-key");
            env::set_var("VAPI_ASSISTANT_ID", "assistant-1");
            env::set_var("AUDIO_DELIVERY", "binary");
            env::set_var("UPSTREAM_MODE", "client_supplied");
            env::set_var("ALLOW_INSECURE_UPSTREAM", "true");
            env::set_var("PLAYBACK_LEAD_TIME_MS", "80");
            env::set_var("OBJECT_MATCH_MODE", "token");
            env::set_var("MAX_WEBSOCKET_CONNECTIONS", "50");
        }

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.provider.api_key.as_deref(), Some("env-key"));
        assert_eq!(config.relay.audio_delivery, AudioDelivery::Binary);
        assert_eq!(config.relay.upstream, UpstreamMode::ClientSupplied);
        assert!(config.provider.allow_insecure_upstream);
        assert_eq!(config.relay.lead_time, Duration::from_millis(80));
        assert_eq!(config.training.match_mode, MatchMode::Token);
        assert_eq!(config.max_websocket_connections, Some(50));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_values() {
        cleanup_env_vars();

        unsafe {
            env::set_var("AUDIO_DELIVERY", "wav");
        }
        let err = ServerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("Invalid audio delivery"));

        cleanup_env_vars();
        unsafe {
            env::set_var("PLAYBACK_LEAD_TIME_MS", "5");
        }
        let err = ServerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("PLAYBACK_LEAD_TIME_MS"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        let yaml_content = r#"
server:
  host: "127.0.0.1"
  port: 8080

provider:
  api_key: "yaml-key"
  connect_timeout_seconds: 5

relay:
  keepalive_interval_seconds: 10
  audio_delivery: binary

training:
  match_mode: token
  strip_punctuation: false
"#;
        fs::write(&config_path, yaml_content).unwrap();

        unsafe {
            env::set_var("HOST", "0.0.0.0");
            env::set_var("VAPI_API_KEY", "env-key");
            env::set_var("VAPI_ASSISTANT_ID", "env-assistant");
        }

        let config = ServerConfig::from_file(&config_path).unwrap();

        // YAML overrides ENV
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.provider.api_key.as_deref(), Some("yaml-key"));
        // ENV value kept where YAML is silent
        assert_eq!(config.provider.assistant_id.as_deref(), Some("env-assistant"));
        assert_eq!(config.port, 8080);
        assert_eq!(config.provider.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.relay.keepalive_interval, Duration::from_secs(10));
        assert_eq!(config.relay.audio_delivery, AudioDelivery::Binary);
        assert_eq!(
            config.training.match_policy(),
            MatchPolicy {
                mode: MatchMode::Token,
                strip_punctuation: false
            }
        );

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_missing_file() {
        cleanup_env_vars();

        let config_path = PathBuf::from("/nonexistent/config.yaml");
        let result = ServerConfig::from_file(&config_path);

        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    #[serial]
    fn test_from_file_invalid_yaml() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.yaml");
        fs::write(&config_path, "invalid: yaml: [content").unwrap();

        let result = ServerConfig::from_file(&config_path);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse YAML")
        );
    }

    #[test]
    #[serial]
    fn test_from_file_with_scenario() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let scenario_path = temp_dir.path().join("drill.yaml");
        fs::write(
            &scenario_path,
            r#"
name: evacuation
steps:
  - step: 1
    objects: ["exit sign"]
    action: locate
    description: Find the nearest exit sign
"#,
        )
        .unwrap();

        let config_path = temp_dir.path().join("config.yaml");
        fs::write(
            &config_path,
            format!(
                "training:\n  scenario_path: \"{}\"\n",
                scenario_path.display()
            ),
        )
        .unwrap();

        let config = ServerConfig::from_file(&config_path).unwrap();
        assert_eq!(config.training.scenario_path, Some(scenario_path));
        assert_eq!(config.training.load_scenario().unwrap().name, "evacuation");

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_rejects_broken_scenario() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let scenario_path = temp_dir.path().join("empty.yaml");
        fs::write(&scenario_path, "name: empty\nsteps: []\n").unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(
            &config_path,
            format!(
                "training:\n  scenario_path: \"{}\"\n",
                scenario_path.display()
            ),
        )
        .unwrap();

        assert!(ServerConfig::from_file(&config_path).is_err());

        cleanup_env_vars();
    }
}
