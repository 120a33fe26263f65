//! Mock voice provider
//!
//! - `POST /call` served by wiremock, answering with a call id and the
//!   WebSocket URL of the mock channel (or with an error status)
//! - the call's WebSocket channel, served by `tokio_tungstenite::accept_async`,
//!   recording what the relay sends and optionally echoing audio back

#![allow(dead_code)]

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_API_KEY: &str = "test-vapi-key";
pub const TEST_ASSISTANT_ID: &str = "assistant-test";
pub const TEST_CALL_ID: &str = "call-mock-1";

/// Something the mock channel received from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Audio(Bytes),
    Json(Value),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MockBehavior {
    /// Send every binary frame straight back.
    pub echo_audio: bool,
    /// Send `status-update` ended after this many binary frames.
    pub hangup_after: Option<usize>,
}

pub struct MockVapi {
    pub ws_url: String,
    received: mpsc::UnboundedReceiver<Received>,
    inject: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
}

impl MockVapi {
    /// Accept provider channels on a random local port.
    pub async fn start(behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_url = format!("ws://{}", listener.local_addr().unwrap());
        let (received_tx, received) = mpsc::unbounded_channel();
        let inject: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>> = Arc::default();
        let inject_slot = inject.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                let (inject_tx, inject_rx) = mpsc::unbounded_channel();
                *inject_slot.lock() = Some(inject_tx);
                tokio::spawn(serve_channel(ws, behavior, received_tx.clone(), inject_rx));
            }
        });

        Self {
            ws_url,
            received,
            inject,
        }
    }

    /// Push a frame to the connected relay.
    pub fn send(&self, message: Message) {
        if let Some(tx) = self.inject.lock().as_ref() {
            let _ = tx.send(message);
        }
    }

    pub fn send_json(&self, value: Value) {
        self.send(Message::Text(value.to_string().into()));
    }

    pub async fn next(&mut self) -> Option<Received> {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn next_audio(&mut self) -> Bytes {
        loop {
            match self.next().await {
                Some(Received::Audio(pcm)) => return pcm,
                Some(Received::Json(_)) => continue,
                None => panic!("mock provider received no audio"),
            }
        }
    }

    /// Next JSON message of `msg_type`, skipping anything else.
    pub async fn next_json(&mut self, msg_type: &str) -> Value {
        loop {
            match self.next().await {
                Some(Received::Json(value)) if value["type"] == msg_type => return value,
                Some(_) => continue,
                None => panic!("mock provider received no {msg_type} message"),
            }
        }
    }
}

async fn serve_channel(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    behavior: MockBehavior,
    received: mpsc::UnboundedSender<Received>,
    mut inject: mpsc::UnboundedReceiver<Message>,
) {
    let (mut write, mut read) = ws.split();
    let mut audio_frames = 0usize;

    loop {
        tokio::select! {
            outgoing = inject.recv() => match outgoing {
                Some(message) => {
                    if write.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Binary(pcm))) => {
                    audio_frames += 1;
                    let _ = received.send(Received::Audio(pcm.clone()));
                    if behavior.echo_audio && write.send(Message::Binary(pcm)).await.is_err() {
                        break;
                    }
                    if behavior.hangup_after == Some(audio_frames) {
                        let ended = json!({"type": "status-update", "status": "ended", "endedReason": "assistant-ended-call"});
                        let _ = write.send(Message::Text(ended.to_string().into())).await;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        let _ = received.send(Received::Json(value));
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Wiremock `POST /call` answering 201 with the mock channel URL.
pub async fn mount_call_created(server: &MockServer, ws_url: &str) {
    Mock::given(method("POST"))
        .and(path("/call"))
        .and(header("authorization", format!("Bearer {TEST_API_KEY}").as_str()))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": TEST_CALL_ID,
            "transport": {"provider": "vapi.websocket", "websocketCallUrl": ws_url}
        })))
        .mount(server)
        .await;
}

/// Wiremock `POST /call` answering with `status`.
pub async fn mount_call_rejected(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path("/call"))
        .respond_with(ResponseTemplate::new(status).set_body_string("upstream unavailable"))
        .mount(server)
        .await;
}
