use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::provider::ProviderError;
use crate::session::SessionKind;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StartChatRequest {
    /// Assistant to use instead of the configured one.
    pub assistant_id: Option<String>,
}

/// `GET /`
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "OK" })))
}

/// `GET /health`
pub async fn health_details(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let provider = &state.config.provider;
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "api_key_configured": provider.api_key.as_deref().is_some_and(|k| !k.is_empty()),
            "assistant_id_configured": provider.assistant_id.as_deref().is_some_and(|a| !a.is_empty()),
            "upstream_mode": state.config.relay.upstream,
            "audio_delivery": state.config.relay.audio_delivery,
            "scenario": state.scenario.name,
        })),
    )
}

/// `POST /chat/start`
///
/// Creates a provider call ahead of the device connection and hands back the
/// call id to open `/ws/{call_id}` with.
pub async fn start_chat(
    State(state): State<Arc<AppState>>,
    request: Option<Json<StartChatRequest>>,
) -> impl IntoResponse {
    let assistant_id = request.and_then(|Json(request)| request.assistant_id);
    match state.calls.create_call_for(assistant_id.as_deref()).await {
        Ok(call) => {
            info!(call_id = %call.id, "Chat session created");
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "message": "Chat session created - connect to WebSocket",
                    "websocket_url": format!("/ws/{}", call.id),
                    "call_id": call.id,
                })),
            )
        }
        Err(e) => {
            let status = match &e {
                ProviderError::InvalidConfiguration(_) => StatusCode::SERVICE_UNAVAILABLE,
                ProviderError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
            warn!(error = %e, "Failed to start chat session");
            (
                status,
                Json(json!({
                    "success": false,
                    "message": "Failed to create chat session",
                    "error": e.to_string(),
                })),
            )
        }
    }
}

/// `GET /status`
pub async fn relay_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = &state.registry;
    (
        StatusCode::OK,
        Json(json!({
            "status": "running",
            "clients": registry.len(),
            "uptime": state.uptime_seconds(),
            "relays": registry.count(SessionKind::Relay),
            "observers": registry.count(SessionKind::Observer),
            "sessions": registry.snapshot(),
        })),
    )
}

/// `POST /clear-connections`
///
/// Each session receives a close request and leaves the registry; its own
/// teardown then closes the provider channel.
pub async fn clear_connections(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cleared = state.registry.close_all();
    let remaining = state.registry.len();
    info!(cleared, remaining, "Cleared device connections");
    (
        StatusCode::OK,
        Json(json!({
            "message": format!("Cleared {cleared} connections"),
            "remaining_clients": remaining,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::session::{DEVICE_QUEUE_SIZE, DeviceRoute, SessionHandle};
    use axum::body::to_bytes;
    use axum::response::Response;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = health_check().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "OK"}));
    }

    fn provider_state(server: &MockServer) -> Arc<AppState> {
        let mut config = ServerConfig::default();
        config.provider.base_url = server.uri();
        config.provider.api_key = Some("test-key".to_string());
        config.provider.assistant_id = Some("assistant-1".to_string());
        AppState::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_health_details() {
        let state = AppState::new(ServerConfig::default()).unwrap();
        let health = body_json(health_details(State(state)).await.into_response()).await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["api_key_configured"], false);
        assert_eq!(health["assistant_id_configured"], false);
        assert_eq!(health["scenario"], "fire_emergency");

        let server = MockServer::start().await;
        let health = body_json(health_details(State(provider_state(&server))).await.into_response()).await;
        assert_eq!(health["api_key_configured"], true);
        assert_eq!(health["assistant_id_configured"], true);
    }

    #[tokio::test]
    async fn test_start_chat_returns_relay_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/call"))
            .and(body_partial_json(json!({"assistantId": "assistant-2"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "call-77",
                "transport": {"websocketCallUrl": "wss://provider.test/call-77"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = StartChatRequest {
            assistant_id: Some("assistant-2".to_string()),
        };
        let response = start_chat(State(provider_state(&server)), Some(Json(request)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({
                "success": true,
                "message": "Chat session created - connect to WebSocket",
                "call_id": "call-77",
                "websocket_url": "/ws/call-77",
            })
        );
    }

    #[tokio::test]
    async fn test_start_chat_reports_provider_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/call"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let response = start_chat(State(provider_state(&server)), None)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Failed to create call: 500");

        let unconfigured = AppState::new(ServerConfig::default()).unwrap();
        let response = start_chat(State(unconfigured), None).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_status_and_clear() {
        let state = AppState::new(ServerConfig::default()).unwrap();
        let (relay_tx, mut relay_rx) = mpsc::channel(DEVICE_QUEUE_SIZE);
        let (observer_tx, _observer_rx) = mpsc::channel(DEVICE_QUEUE_SIZE);
        state
            .registry
            .register(SessionHandle::new("call-1", SessionKind::Relay, relay_tx))
            .unwrap();
        state
            .registry
            .register(SessionHandle::new("obs-1", SessionKind::Observer, observer_tx))
            .unwrap();

        let status = body_json(relay_status(State(state.clone())).await.into_response()).await;
        assert_eq!(status["status"], "running");
        assert_eq!(status["clients"], 2);
        assert_eq!(status["relays"], 1);
        assert_eq!(status["observers"], 1);

        let cleared = body_json(clear_connections(State(state.clone())).await.into_response()).await;
        assert_eq!(cleared["message"], "Cleared 2 connections");
        assert_eq!(cleared["remaining_clients"], 0);
        assert_eq!(relay_rx.try_recv().unwrap(), DeviceRoute::Close);
    }
}
