use std::path::PathBuf;
use std::time::Duration;

use super::yaml::YamlConfig;
use super::{ServerConfig, TlsConfig, env};

/// Environment (with defaults) as the base, YAML values on top.
pub(crate) fn merge_config(
    yaml: Option<YamlConfig>,
) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = env::from_env()?;
    let Some(yaml) = yaml else {
        return Ok(config);
    };

    if let Some(server) = yaml.server {
        if let Some(host) = server.host {
            config.host = host;
        }
        if let Some(port) = server.port {
            config.port = port;
        }
        if let Some(tls) = server.tls {
            match tls.enabled {
                Some(false) => config.tls = None,
                Some(true) => {
                    let current = config.tls.take();
                    let cert_path = tls
                        .cert_path
                        .map(PathBuf::from)
                        .or_else(|| current.as_ref().map(|t| t.cert_path.clone()))
                        .ok_or("server.tls.enabled is true but cert_path is not set")?;
                    let key_path = tls
                        .key_path
                        .map(PathBuf::from)
                        .or_else(|| current.as_ref().map(|t| t.key_path.clone()))
                        .ok_or("server.tls.enabled is true but key_path is not set")?;
                    config.tls = Some(TlsConfig {
                        cert_path,
                        key_path,
                    });
                }
                None => {
                    if let Some(current) = config.tls.as_mut() {
                        if let Some(cert_path) = tls.cert_path {
                            current.cert_path = PathBuf::from(cert_path);
                        }
                        if let Some(key_path) = tls.key_path {
                            current.key_path = PathBuf::from(key_path);
                        }
                    }
                }
            }
        }
    }

    if let Some(provider) = yaml.provider {
        if provider.api_key.is_some() {
            config.provider.api_key = provider.api_key;
        }
        if provider.assistant_id.is_some() {
            config.provider.assistant_id = provider.assistant_id;
        }
        if let Some(base_url) = provider.base_url {
            config.provider.base_url = base_url;
        }
        if let Some(transport) = provider.transport {
            config.provider.transport = transport;
        }
        if let Some(seconds) = provider.connect_timeout_seconds {
            config.provider.connect_timeout = Duration::from_secs(seconds);
        }
        if let Some(allow) = provider.allow_insecure_upstream {
            config.provider.allow_insecure_upstream = allow;
        }
    }

    if let Some(relay) = yaml.relay {
        if let Some(seconds) = relay.keepalive_interval_seconds {
            config.relay.keepalive_interval = Duration::from_secs(seconds);
        }
        if let Some(rate) = relay.sample_rate {
            config.relay.sample_rate = rate;
        }
        if let Some(ms) = relay.lead_time_ms {
            config.relay.lead_time = Duration::from_millis(ms);
        }
        if let Some(ms) = relay.turn_idle_timeout_ms {
            config.relay.turn_idle_timeout = Duration::from_millis(ms);
        }
        if let Some(delivery) = relay.audio_delivery {
            config.relay.audio_delivery = delivery;
        }
        if let Some(upstream) = relay.upstream {
            config.relay.upstream = upstream;
        }
        if let Some(bytes) = relay.max_message_bytes {
            config.relay.max_message_bytes = bytes;
        }
    }

    if let Some(training) = yaml.training {
        if let Some(path) = training.scenario_path {
            config.training.scenario_path = Some(PathBuf::from(path));
        }
        if let Some(mode) = training.match_mode {
            config.training.match_mode = mode;
        }
        if let Some(strip) = training.strip_punctuation {
            config.training.strip_punctuation = strip;
        }
    }

    if let Some(security) = yaml.security {
        if security.cors_allowed_origins.is_some() {
            config.cors_allowed_origins = security.cors_allowed_origins;
        }
        if let Some(rps) = security.rate_limit_requests_per_second {
            config.rate_limit_requests_per_second = rps;
        }
        if let Some(burst) = security.rate_limit_burst_size {
            config.rate_limit_burst_size = burst;
        }
        if security.max_websocket_connections.is_some() {
            config.max_websocket_connections = security.max_websocket_connections;
        }
        if let Some(per_ip) = security.max_connections_per_ip {
            config.max_connections_per_ip = per_ip;
        }
    }

    Ok(config)
}
