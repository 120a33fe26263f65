use std::time::Duration;

use super::{ServerConfig, TlsConfig, TrainingConfig};

const MIN_LEAD_TIME: Duration = Duration::from_millis(10);
const MAX_LEAD_TIME: Duration = Duration::from_millis(1000);
const MIN_KEEPALIVE: Duration = Duration::from_secs(1);

pub(crate) fn validate(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    validate_port(config.port)?;
    validate_lead_time(config.relay.lead_time)?;
    validate_keepalive(config.relay.keepalive_interval)?;
    validate_sample_rate(config.relay.sample_rate)?;
    validate_tls(&config.tls)?;
    validate_training(&config.training)?;
    Ok(())
}

pub(crate) fn validate_port(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    if port == 0 {
        return Err("PORT must be non-zero".into());
    }
    Ok(())
}

pub(crate) fn validate_lead_time(lead_time: Duration) -> Result<(), Box<dyn std::error::Error>> {
    if lead_time < MIN_LEAD_TIME || lead_time > MAX_LEAD_TIME {
        return Err(format!(
            "PLAYBACK_LEAD_TIME_MS must be between {} and {} ms, got {} ms",
            MIN_LEAD_TIME.as_millis(),
            MAX_LEAD_TIME.as_millis(),
            lead_time.as_millis()
        )
        .into());
    }
    Ok(())
}

pub(crate) fn validate_keepalive(interval: Duration) -> Result<(), Box<dyn std::error::Error>> {
    if interval < MIN_KEEPALIVE {
        return Err("KEEPALIVE_INTERVAL_SECONDS must be at least 1".into());
    }
    Ok(())
}

pub(crate) fn validate_sample_rate(rate: u32) -> Result<(), Box<dyn std::error::Error>> {
    if rate == 0 {
        return Err("AUDIO_SAMPLE_RATE must be non-zero".into());
    }
    Ok(())
}

pub(crate) fn validate_tls(tls: &Option<TlsConfig>) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(tls) = tls {
        if !tls.cert_path.exists() {
            return Err(format!(
                "TLS certificate file not found: {}",
                tls.cert_path.display()
            )
            .into());
        }
        if !tls.key_path.exists() {
            return Err(format!("TLS key file not found: {}", tls.key_path.display()).into());
        }
    }
    Ok(())
}

/// A configured scenario file must load and pass its structural check.
pub(crate) fn validate_training(training: &TrainingConfig) -> Result<(), Box<dyn std::error::Error>> {
    if training.scenario_path.is_some() {
        training.load_scenario()?;
    }
    Ok(())
}
