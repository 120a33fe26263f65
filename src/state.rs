//! Shared application state.
//!
//! One [`AppState`] is built at startup and handed to every handler behind an
//! `Arc`. It owns the session registry, the call client behind
//! `POST /chat/start`, the upstream connector used by relay sessions, the
//! loaded training scenario and the WebSocket connection counters enforced by
//! the connection-limit middleware.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::core::provider::{
    CallClient, ProviderError, SharedConnector, WebSocketConnector,
};
use crate::core::training::{ScenarioError, TrainingScenario};
use crate::session::{SessionDeps, SessionRegistry};

/// Why a WebSocket connection slot was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectionLimitError {
    #[error("global WebSocket connection limit reached")]
    GlobalLimitReached,
    #[error("per-IP WebSocket connection limit reached")]
    PerIpLimitReached,
}

/// Failures while assembling the state at startup.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to build provider client: {0}")]
    Provider(#[from] ProviderError),
    #[error("Failed to load training scenario: {0}")]
    Scenario(#[from] ScenarioError),
}

pub struct AppState {
    pub config: ServerConfig,
    pub registry: SessionRegistry,
    pub calls: CallClient,
    pub connector: SharedConnector,
    pub scenario: Arc<TrainingScenario>,
    started_at: Instant,
    ws_connections: AtomicUsize,
    ip_connections: DashMap<IpAddr, usize>,
}

impl AppState {
    /// Build the state with the HTTP call client and WebSocket connector
    /// described by `config.provider`.
    pub fn new(config: ServerConfig) -> Result<Arc<Self>, StateError> {
        let calls = CallClient::new(config.provider.call_client_config())?;
        let connector: SharedConnector = Arc::new(WebSocketConnector::new(
            calls.clone(),
            config.provider.connect_timeout,
        ));
        Self::with_connector(config, calls, connector)
    }

    /// Build the state around an existing connector.
    pub fn with_connector(
        config: ServerConfig,
        calls: CallClient,
        connector: SharedConnector,
    ) -> Result<Arc<Self>, StateError> {
        let scenario = Arc::new(config.training.load_scenario()?);
        info!(
            scenario = %scenario.name,
            steps = scenario.steps.len(),
            "Training scenario loaded"
        );

        Ok(Arc::new(Self {
            config,
            registry: SessionRegistry::new(),
            calls,
            connector,
            scenario,
            started_at: Instant::now(),
            ws_connections: AtomicUsize::new(0),
            ip_connections: DashMap::new(),
        }))
    }

    pub fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            registry: self.registry.clone(),
            connector: self.connector.clone(),
            scenario: self.scenario.clone(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    // =========================================================================
    // Connection accounting
    // =========================================================================

    /// Reserve a WebSocket slot for `ip`. Every successful call must be paired
    /// with [`release_connection`](Self::release_connection).
    pub fn try_acquire_connection(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        let mut per_ip = self.ip_connections.entry(ip).or_insert(0);
        if *per_ip >= self.config.max_connections_per_ip as usize {
            return Err(ConnectionLimitError::PerIpLimitReached);
        }

        if let Some(max) = self.config.max_websocket_connections {
            let reserved = self
                .ws_connections
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    (current < max).then_some(current + 1)
                });
            if reserved.is_err() {
                drop(per_ip);
                self.ip_connections.remove_if(&ip, |_, count| *count == 0);
                return Err(ConnectionLimitError::GlobalLimitReached);
            }
        } else {
            self.ws_connections.fetch_add(1, Ordering::AcqRel);
        }

        *per_ip += 1;
        debug!(ip = %ip, total = self.ws_connection_count(), "WebSocket slot acquired");
        Ok(())
    }

    pub fn release_connection(&self, ip: IpAddr) {
        let remove = match self.ip_connections.get_mut(&ip) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => return,
        };
        if remove {
            self.ip_connections.remove_if(&ip, |_, count| *count == 0);
        }
        let _ = self
            .ws_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(1))
            });
        debug!(ip = %ip, total = self.ws_connection_count(), "WebSocket slot released");
    }

    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::Acquire)
    }

    pub fn ip_connection_count(&self, ip: &IpAddr) -> usize {
        self.ip_connections.get(ip).map(|count| *count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    fn config_with_limits(global: Option<usize>, per_ip: u32) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.max_websocket_connections = global;
        config.max_connections_per_ip = per_ip;
        config
    }

    #[tokio::test]
    async fn test_per_ip_limit() {
        let state = AppState::new(config_with_limits(Some(10), 3)).unwrap();
        let ip: IpAddr = Ipv4Addr::new(192, 168, 1, 100).into();

        assert_eq!(state.ws_connection_count(), 0);
        for expected in 1..=3 {
            assert!(state.try_acquire_connection(ip).is_ok());
            assert_eq!(state.ip_connection_count(&ip), expected);
        }
        assert_eq!(
            state.try_acquire_connection(ip),
            Err(ConnectionLimitError::PerIpLimitReached)
        );
        assert_eq!(state.ws_connection_count(), 3);

        state.release_connection(ip);
        assert_eq!(state.ip_connection_count(&ip), 2);
        assert!(state.try_acquire_connection(ip).is_ok());
    }

    #[tokio::test]
    async fn test_global_limit() {
        let state = AppState::new(config_with_limits(Some(2), 10)).unwrap();
        let ips: Vec<IpAddr> = (1..=3).map(|i| Ipv4Addr::new(10, 0, 0, i).into()).collect();

        assert!(state.try_acquire_connection(ips[0]).is_ok());
        assert!(state.try_acquire_connection(ips[1]).is_ok());
        assert_eq!(
            state.try_acquire_connection(ips[2]),
            Err(ConnectionLimitError::GlobalLimitReached)
        );
        assert_eq!(state.ip_connection_count(&ips[2]), 0);

        state.release_connection(ips[0]);
        assert_eq!(state.ip_connection_count(&ips[0]), 0);
        assert!(state.try_acquire_connection(ips[2]).is_ok());
    }

    #[tokio::test]
    async fn test_release_unknown_ip_is_noop() {
        let state = AppState::new(ServerConfig::default()).unwrap();
        state.release_connection(Ipv4Addr::LOCALHOST.into());
        assert_eq!(state.ws_connection_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_scenario_file_fails() {
        let mut config = ServerConfig::default();
        config.training.scenario_path = Some(PathBuf::from("/nonexistent/scenario.yaml"));
        assert!(matches!(AppState::new(config), Err(StateError::Scenario(_))));
    }

    #[tokio::test]
    async fn test_session_deps_share_registry() {
        let state = AppState::new(ServerConfig::default()).unwrap();
        let deps = state.session_deps();
        assert_eq!(deps.scenario.name, "fire_emergency");
        assert!(deps.registry.is_empty());
    }
}
