use std::path::PathBuf;
use std::time::Duration;

use super::utils::{env_bool, env_parse, env_parse_opt, env_var};
use super::{ProviderConfig, RelayConfig, ServerConfig, TlsConfig, TrainingConfig};
use crate::core::training::MatchMode;
use crate::session::{AudioDelivery, UpstreamMode};

/// Build a configuration from environment variables, falling back to defaults.
pub(crate) fn from_env() -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let defaults = ServerConfig::default();

    let tls = load_tls()?;

    let provider = ProviderConfig {
        api_key: env_var("VAPI_API_KEY"),
        assistant_id: env_var("VAPI_ASSISTANT_ID"),
        base_url: env_var("VAPI_BASE_URL").unwrap_or_else(|| defaults.provider.base_url.clone()),
        transport: env_var("VAPI_TRANSPORT").unwrap_or_else(|| defaults.provider.transport.clone()),
        connect_timeout: Duration::from_secs(env_parse(
            "PROVIDER_CONNECT_TIMEOUT_SECONDS",
            defaults.provider.connect_timeout.as_secs(),
        )?),
        allow_insecure_upstream: env_bool(
            "ALLOW_INSECURE_UPSTREAM",
            defaults.provider.allow_insecure_upstream,
        )?,
    };

    let relay = RelayConfig {
        keepalive_interval: Duration::from_secs(env_parse(
            "KEEPALIVE_INTERVAL_SECONDS",
            defaults.relay.keepalive_interval.as_secs(),
        )?),
        sample_rate: env_parse("AUDIO_SAMPLE_RATE", defaults.relay.sample_rate)?,
        lead_time: Duration::from_millis(env_parse(
            "PLAYBACK_LEAD_TIME_MS",
            defaults.relay.lead_time.as_millis() as u64,
        )?),
        turn_idle_timeout: Duration::from_millis(env_parse(
            "TURN_IDLE_TIMEOUT_MS",
            defaults.relay.turn_idle_timeout.as_millis() as u64,
        )?),
        audio_delivery: env_parse::<AudioDelivery>("AUDIO_DELIVERY", defaults.relay.audio_delivery)?,
        upstream: env_parse::<UpstreamMode>("UPSTREAM_MODE", defaults.relay.upstream)?,
        max_message_bytes: env_parse("MAX_DEVICE_MESSAGE_BYTES", defaults.relay.max_message_bytes)?,
    };

    let training = TrainingConfig {
        scenario_path: env_var("TRAINING_SCENARIO_PATH").map(PathBuf::from),
        match_mode: env_parse::<MatchMode>("OBJECT_MATCH_MODE", defaults.training.match_mode)?,
        strip_punctuation: env_bool(
            "OBJECT_MATCH_STRIP_PUNCTUATION",
            defaults.training.strip_punctuation,
        )?,
    };

    Ok(ServerConfig {
        host: env_var("HOST").unwrap_or_else(|| defaults.host.clone()),
        port: env_parse("PORT", defaults.port)?,
        tls,
        provider,
        relay,
        training,
        cors_allowed_origins: env_var("CORS_ALLOWED_ORIGINS"),
        rate_limit_requests_per_second: env_parse(
            "RATE_LIMIT_REQUESTS_PER_SECOND",
            defaults.rate_limit_requests_per_second,
        )?,
        rate_limit_burst_size: env_parse("RATE_LIMIT_BURST_SIZE", defaults.rate_limit_burst_size)?,
        max_websocket_connections: env_parse_opt("MAX_WEBSOCKET_CONNECTIONS")?,
        max_connections_per_ip: env_parse("MAX_CONNECTIONS_PER_IP", defaults.max_connections_per_ip)?,
    })
}

fn load_tls() -> Result<Option<TlsConfig>, Box<dyn std::error::Error>> {
    if !env_bool("TLS_ENABLED", false)? {
        return Ok(None);
    }
    let cert_path = env_var("TLS_CERT_PATH")
        .ok_or("TLS_ENABLED is true but TLS_CERT_PATH is not set")?;
    let key_path = env_var("TLS_KEY_PATH")
        .ok_or("TLS_ENABLED is true but TLS_KEY_PATH is not set")?;
    Ok(Some(TlsConfig {
        cert_path: PathBuf::from(cert_path),
        key_path: PathBuf::from(key_path),
    }))
}
