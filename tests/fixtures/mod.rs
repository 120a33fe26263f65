//! Gateway fixtures: configuration, a live server on a random port and a
//! device-side WebSocket client.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use voicelink_gateway::{ServerConfig, server, state::AppState};

pub type DeviceSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration pointing the call client at `base_url`.
pub fn test_config(base_url: &str) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.host = "127.0.0.1".to_string();
    config.provider.base_url = base_url.to_string();
    config.provider.api_key = Some(super::mock_providers::TEST_API_KEY.to_string());
    config.provider.assistant_id = Some(super::mock_providers::TEST_ASSISTANT_ID.to_string());
    config.provider.connect_timeout = Duration::from_secs(5);
    config.provider.allow_insecure_upstream = true;
    config
}

/// Serve the full application, limits and layers included, on a random port.
pub async fn start_gateway(config: ServerConfig) -> (SocketAddr, Arc<AppState>) {
    let state = AppState::new(config).unwrap();
    let app = server::build_router(state.clone()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, state)
}

pub async fn connect_device(addr: SocketAddr, path: &str) -> DeviceSocket {
    let (socket, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    socket
}

pub async fn send_json(socket: &mut DeviceSocket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Next JSON message that is not a keepalive. `None` once the socket closes.
pub async fn next_json(socket: &mut DeviceSocket) -> Option<Value> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for the gateway")?;
        match message {
            Ok(Message::Text(text)) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["type"] != "ping" {
                    return Some(value);
                }
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Next JSON message of `msg_type`, skipping others.
pub async fn next_of_type(socket: &mut DeviceSocket, msg_type: &str) -> Value {
    loop {
        match next_json(socket).await {
            Some(value) if value["type"] == msg_type => return value,
            Some(_) => continue,
            None => panic!("socket closed before a {msg_type} message"),
        }
    }
}

/// Poll until the registry holds `expected` sessions.
pub async fn wait_for_sessions(state: &AppState, expected: usize) {
    for _ in 0..100 {
        if state.registry.len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "expected {expected} sessions, registry holds {}",
        state.registry.len()
    );
}
