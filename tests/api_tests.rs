//! HTTP surface and gateway-level behaviour: health, status, call creation,
//! connection clearing, per-IP limits and custom training scenarios.

mod fixtures;
mod mock_providers;

use axum::body::{Body, to_bytes};
use http::{Request, StatusCode};
use serde_json::{Value, json};
use std::fs;
use tempfile::TempDir;
use tokio_tungstenite::{connect_async, tungstenite};
use tower::ServiceExt;
use wiremock::MockServer;

use fixtures::{
    connect_device, next_json, next_of_type, send_json, start_gateway, test_config,
    wait_for_sessions,
};
use mock_providers::{MockBehavior, MockVapi, TEST_CALL_ID, mount_call_created};
use voicelink_gateway::{ServerConfig, routes, state::AppState};

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_and_empty_status() {
    let state = AppState::new(ServerConfig::default()).unwrap();
    let app = routes::api::create_api_router().with_state(state);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"status": "OK"}));

    let response = app
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["status"], "running");
    assert_eq!(status["clients"], 0);
    assert_eq!(status["sessions"], json!([]));
}

#[tokio::test]
async fn test_clear_connections_requires_post() {
    let state = AppState::new(ServerConfig::default()).unwrap();
    let app = routes::api::create_api_router().with_state(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/clear-connections")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/clear-connections")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"message": "Cleared 0 connections", "remaining_clients": 0})
    );
}

#[tokio::test]
async fn test_chat_start_then_device_connects() {
    let vapi = MockVapi::start(MockBehavior::default()).await;
    let calls = MockServer::start().await;
    mount_call_created(&calls, &vapi.ws_url).await;
    let (addr, _state) = start_gateway(test_config(&calls.uri())).await;

    let http = reqwest::Client::new();
    let health: Value = http
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["api_key_configured"], true);
    assert_eq!(health["assistant_id_configured"], true);

    let response = http
        .post(format!("http://{addr}/chat/start"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let started: Value = response.json().await.unwrap();
    assert_eq!(started["success"], true);
    assert_eq!(started["call_id"], TEST_CALL_ID);
    let websocket_url = started["websocket_url"].as_str().unwrap();
    assert_eq!(websocket_url, format!("/ws/{TEST_CALL_ID}"));

    let mut device = connect_device(addr, websocket_url).await;
    next_of_type(&mut device, "vapi_connected").await;
}

#[tokio::test]
async fn test_live_status_and_clear() {
    let vapi = MockVapi::start(MockBehavior::default()).await;
    let calls = MockServer::start().await;
    mount_call_created(&calls, &vapi.ws_url).await;

    let (addr, state) = start_gateway(test_config(&calls.uri())).await;
    let mut device = connect_device(addr, "/ws/station-7").await;
    next_of_type(&mut device, "vapi_connected").await;
    let mut observer = connect_device(addr, "/observe").await;
    next_of_type(&mut observer, "info").await;
    wait_for_sessions(&state, 2).await;

    let http = reqwest::Client::new();
    let status: Value = http
        .get(format!("http://{addr}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["clients"], 2);
    assert_eq!(status["relays"], 1);
    assert_eq!(status["observers"], 1);
    let ids: Vec<&str> = status["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|s| s["call_id"].as_str())
        .collect();
    assert!(ids.contains(&"station-7"));

    let cleared: Value = http
        .post(format!("http://{addr}/clear-connections"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cleared["message"], "Cleared 2 connections");
    assert_eq!(cleared["remaining_clients"], 0);

    // Both sockets are closed by the gateway
    while next_json(&mut device).await.is_some() {}
    while next_json(&mut observer).await.is_some() {}
    wait_for_sessions(&state, 0).await;
}

#[tokio::test]
async fn test_per_ip_limit_rejects_extra_device() {
    let vapi = MockVapi::start(MockBehavior::default()).await;
    let calls = MockServer::start().await;
    mount_call_created(&calls, &vapi.ws_url).await;

    let mut config = test_config(&calls.uri());
    config.max_connections_per_ip = 1;
    let (addr, state) = start_gateway(config).await;

    let mut first = connect_device(addr, "/ws/first").await;
    next_of_type(&mut first, "vapi_connected").await;

    match connect_async(format!("ws://{addr}/ws/second")).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        }
        other => panic!("expected 429, got {:?}", other.map(|(_, r)| r.status())),
    }
    assert_eq!(state.ws_connection_count(), 1);

    // The slot frees once the first device leaves
    drop(first);
    wait_for_sessions(&state, 0).await;
    for _ in 0..50 {
        if state.ws_connection_count() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    let mut again = connect_device(addr, "/ws/second").await;
    next_of_type(&mut again, "vapi_connected").await;
}

#[tokio::test]
async fn test_custom_scenario_from_file() {
    let dir = TempDir::new().unwrap();
    let scenario_path = dir.path().join("valve.yaml");
    fs::write(
        &scenario_path,
        r#"
name: pressure_drill
steps:
  - step: 1
    objects: ["red valve"]
    action: turn
    description: Close the red valve
  - step: 2
    objects: ["ladder"]
    action: climb
    description: Climb the ladder to the gauge
"#,
    )
    .unwrap();

    let vapi = MockVapi::start(MockBehavior::default()).await;
    let calls = MockServer::start().await;
    mount_call_created(&calls, &vapi.ws_url).await;

    let mut config = test_config(&calls.uri());
    config.training.scenario_path = Some(scenario_path);
    let (addr, state) = start_gateway(config).await;
    assert_eq!(state.scenario.name, "pressure_drill");

    let mut device = connect_device(addr, "/ws/drill").await;
    next_of_type(&mut device, "vapi_connected").await;

    send_json(&mut device, json!({"type": "object_pinched", "object_name": "Red_Valve (1)"})).await;
    let advanced = next_of_type(&mut device, "step_advanced").await;
    assert_eq!(advanced["current_step"], 2);
    assert_eq!(advanced["next_instruction"], "Climb the ladder to the gauge");

    send_json(&mut device, json!({"type": "object_pinched", "object_name": "Ladder"})).await;
    let done = next_of_type(&mut device, "training_complete").await;
    assert_eq!(done["message"], "Pressure drill training completed successfully!");
}

#[tokio::test]
async fn test_invalid_scenario_fails_state() {
    let dir = TempDir::new().unwrap();
    let scenario_path = dir.path().join("broken.yaml");
    fs::write(&scenario_path, "name: empty\nsteps: []\n").unwrap();

    let mut config = ServerConfig::default();
    config.training.scenario_path = Some(scenario_path);
    let Err(err) = AppState::new(config) else {
        panic!("a scenario without steps must be rejected");
    };
    assert!(err.to_string().contains("has no steps"));
}
