//! Router assembly and the HTTP(S) listener.
//!
//! Layer order, outermost first: security headers, rate limiting, CORS, then
//! the route groups. Device WebSocket routes additionally pass through the
//! connection-limit middleware so a slot is reserved before the upgrade.

use axum::{Router, middleware};
use axum_server::tls_rustls::RustlsConfig;
use http::header::{AUTHORIZATION, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS};
use http::{HeaderValue, Method};
use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};

use crate::middleware::connection_limit_middleware;
use crate::routes;
use crate::state::AppState;

/// Rates at or above this many requests per second switch the limiter off.
pub const RATE_LIMIT_DISABLED_AT: u32 = 100_000;

/// How long TLS connections get to finish after a shutdown signal.
const TLS_DRAIN_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid rate limiter settings: {rps}/s with burst {burst}")]
    RateLimit { rps: u32, burst: u32 },

    #[error("Invalid server address '{address}': {source}")]
    Address {
        address: String,
        #[source]
        source: AddrParseError,
    },

    #[error("Failed to load TLS certificates from {} and {}: {source}", .cert.display(), .key.display())]
    Tls {
        cert: PathBuf,
        key: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The complete application: API routes, device sockets and shared layers.
pub fn build_router(state: Arc<AppState>) -> Result<Router, ServerError> {
    let config = &state.config;

    let device_routes = routes::relay::create_relay_router().layer(
        middleware::from_fn_with_state(state.clone(), connection_limit_middleware),
    );

    let rps = config.rate_limit_requests_per_second;
    let burst = config.rate_limit_burst_size;
    let rate_limit = if rps < RATE_LIMIT_DISABLED_AT {
        let limits = GovernorConfigBuilder::default()
            .per_second(u64::from(rps))
            .burst_size(burst)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or(ServerError::RateLimit { rps, burst })?;
        Some(GovernorLayer::new(limits))
    } else {
        info!(rps, "Rate limiting disabled");
        None
    };

    let headers = tower::ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ));

    Ok(routes::api::create_api_router()
        .merge(device_routes)
        .with_state(state.clone())
        .layer(cors_for(config.cors_allowed_origins.as_deref()))
        .layer(tower::util::option_layer(rate_limit))
        .layer(headers))
}

/// `"*"` allows any origin without credentials; a comma-separated list allows
/// those origins with credentials; nothing configured means same-origin only.
fn cors_for(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    match origins.map(str::trim) {
        Some("*") => base.allow_origin(Any),
        Some(list) => {
            let allowed: Vec<HeaderValue> = list
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .filter_map(|origin| match HeaderValue::from_str(origin) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        warn!(origin, "Ignoring unparseable CORS origin");
                        None
                    }
                })
                .collect();
            base.allow_origin(AllowOrigin::list(allowed))
                .allow_credentials(true)
        }
        None => {
            info!("CORS_ALLOWED_ORIGINS not set, serving same-origin requests only");
            base
        }
    }
}

/// Serve until Ctrl-C, over TLS when the configuration carries certificates.
pub async fn serve(state: Arc<AppState>) -> Result<(), ServerError> {
    let app = build_router(state.clone())?;
    let address = state.config.address();
    let socket_addr: SocketAddr = address.parse().map_err(|source| ServerError::Address {
        address: address.clone(),
        source,
    })?;
    let service = app.into_make_service_with_connect_info::<SocketAddr>();

    match state.config.tls.clone() {
        Some(tls) => {
            let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                .await
                .map_err(|source| ServerError::Tls {
                    cert: tls.cert_path.clone(),
                    key: tls.key_path.clone(),
                    source,
                })?;
            let handle = axum_server::Handle::new();
            tokio::spawn(shutdown_signal(state.clone(), Some(handle.clone())));

            info!(address = %socket_addr, "Relay listening on https");
            axum_server::bind_rustls(socket_addr, rustls)
                .handle(handle)
                .serve(service)
                .await?;
        }
        None => {
            let listener = TcpListener::bind(socket_addr).await?;
            info!(address = %socket_addr, "Relay listening on http");
            axum::serve(listener, service)
                .with_graceful_shutdown(shutdown_signal(state.clone(), None))
                .await?;
        }
    }

    info!("Server stopped");
    Ok(())
}

/// Wait for Ctrl-C, then ask every device session to close.
async fn shutdown_signal(state: Arc<AppState>, tls_handle: Option<axum_server::Handle>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    let closed = state.registry.close_all();
    info!(closed, "Shutting down, closing device sessions");
    if let Some(handle) = tls_handle {
        handle.graceful_shutdown(Some(TLS_DRAIN_PERIOD));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use axum::body::Body;
    use http::{Request, StatusCode};
    use std::net::Ipv4Addr;
    use tower::ServiceExt;

    fn request(path: &str) -> Request<Body> {
        let mut request = Request::builder()
            .uri(path)
            .header("origin", "https://trainer.example")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(axum::extract::ConnectInfo(SocketAddr::from((
                Ipv4Addr::LOCALHOST,
                40_000,
            ))));
        request
    }

    #[tokio::test]
    async fn test_security_headers_applied() {
        let state = AppState::new(ServerConfig::default()).unwrap();
        let app = build_router(state).unwrap();

        let response = app.oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(response.headers()[X_FRAME_OPTIONS], "DENY");
    }

    #[tokio::test]
    async fn test_cors_origin_list() {
        let mut config = ServerConfig::default();
        config.cors_allowed_origins = Some("https://trainer.example, https://other.example".into());
        let app = build_router(AppState::new(config).unwrap()).unwrap();

        let response = app.oneshot(request("/status")).await.unwrap();
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "https://trainer.example"
        );
        assert_eq!(response.headers()["access-control-allow-credentials"], "true");
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_burst() {
        let mut config = ServerConfig::default();
        config.rate_limit_requests_per_second = 1;
        config.rate_limit_burst_size = 2;
        let app = build_router(AppState::new(config).unwrap()).unwrap();

        let mut statuses = Vec::new();
        for _ in 0..4 {
            statuses.push(app.clone().oneshot(request("/")).await.unwrap().status());
        }
        assert_eq!(statuses[0], StatusCode::OK);
        assert!(statuses.contains(&StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn test_invalid_rate_limit() {
        let mut config = ServerConfig::default();
        config.rate_limit_requests_per_second = 0;
        let err = build_router(AppState::new(config).unwrap()).unwrap_err();
        assert!(matches!(err, ServerError::RateLimit { rps: 0, .. }));
    }
}
