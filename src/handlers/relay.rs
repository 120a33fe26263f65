//! Device WebSocket endpoints.
//!
//! `/ws/{call_id}` runs a relay session with its own provider channel;
//! `/observe` runs an AR observer that feeds interaction events into a relay's
//! conversation. Both split the socket into a writer task draining the
//! session's [`DeviceRoute`] queue and an inbound stream of [`DeviceFrame`]s.

use axum::{
    Extension,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::middleware::ClientIp;
use crate::session::{
    DEVICE_QUEUE_SIZE, DeviceFrame, DeviceRoute, RelayPolicy, RelaySession,
};
use crate::state::AppState;

/// How long the writer gets to flush the close frame after the session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
pub struct ObserveParams {
    /// Relay whose conversation receives this observer's events.
    pub call_id: Option<String>,
}

/// `GET /ws/{call_id}`
pub async fn relay_handler(
    ws: WebSocketUpgrade,
    Path(call_id): Path<String>,
    State(state): State<Arc<AppState>>,
    client_ip: Option<Extension<ClientIp>>,
) -> Response {
    info!(call_id = %call_id, "Relay WebSocket upgrade requested");
    let policy = RelayPolicy::relay(&state.config);
    upgrade(ws, state, call_id, policy, client_ip.map(|Extension(ip)| ip))
}

/// `GET /observe?call_id=<target>`
pub async fn observer_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ObserveParams>,
    State(state): State<Arc<AppState>>,
    client_ip: Option<Extension<ClientIp>>,
) -> Response {
    let session_id = format!("observer-{}", Uuid::new_v4());
    info!(
        session_id = %session_id,
        target = ?params.call_id,
        "Observer WebSocket upgrade requested"
    );
    let policy = RelayPolicy::observer(&state.config, params.call_id);
    upgrade(ws, state, session_id, policy, client_ip.map(|Extension(ip)| ip))
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: Arc<AppState>,
    session_id: String,
    policy: RelayPolicy,
    client_ip: Option<ClientIp>,
) -> Response {
    let max_bytes = state.config.relay.max_message_bytes;
    ws.max_frame_size(max_bytes)
        .max_message_size(max_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, session_id, policy, client_ip))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    session_id: String,
    policy: RelayPolicy,
    client_ip: Option<ClientIp>,
) {
    info!(call_id = %session_id, kind = %policy.kind, "Device connected");

    let (sink, stream) = socket.split();
    let (device_tx, device_rx) = mpsc::channel::<DeviceRoute>(DEVICE_QUEUE_SIZE);
    let mut writer = spawn_writer(session_id.clone(), sink, device_rx);

    let mut session = RelaySession::new(session_id.clone(), policy, state.session_deps(), device_tx);
    session.run(device_frames(session_id.clone(), stream)).await;
    drop(session);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        debug!(call_id = %session_id, "Device writer did not drain in time");
        writer.abort();
    }

    if let Some(ClientIp(ip)) = client_ip {
        state.release_connection(ip);
    }
    info!(call_id = %session_id, "Device disconnected");
}

/// Writer task: one socket frame per route, stopping after `Close`.
fn spawn_writer(
    call_id: String,
    mut sink: SplitSink<WebSocket, Message>,
    mut routes: mpsc::Receiver<DeviceRoute>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(route) = routes.recv().await {
            let result = match route {
                DeviceRoute::Outgoing(message) => match serde_json::to_string(&message) {
                    Ok(json) => {
                        debug!(
                            call_id = %call_id,
                            direction = "relay->device",
                            msg_type = message.type_name(),
                            "Device message"
                        );
                        sink.send(Message::Text(json.into())).await
                    }
                    Err(e) => {
                        warn!(call_id = %call_id, "Failed to serialize device message: {}", e);
                        continue;
                    }
                },
                DeviceRoute::Audio(pcm) => sink.send(Message::Binary(pcm)).await,
                DeviceRoute::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };

            if let Err(e) = result {
                info!(call_id = %call_id, "Device socket closed while writing: {}", e);
                break;
            }
        }
    })
}

/// Socket messages as session frames. Control frames are answered by axum.
fn device_frames<S>(call_id: String, stream: S) -> impl Stream<Item = DeviceFrame> + Unpin + Send
where
    S: Stream<Item = Result<Message, axum::Error>> + Send + 'static,
{
    Box::pin(stream.filter_map(move |incoming| {
        let frame = match incoming {
            Ok(Message::Text(text)) => Some(DeviceFrame::Text(text.as_str().to_owned())),
            Ok(Message::Binary(pcm)) => Some(DeviceFrame::Binary(pcm)),
            Ok(Message::Close(reason)) => {
                debug!(call_id = %call_id, reason = ?reason, "Device sent close");
                Some(DeviceFrame::Close)
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Err(e) => {
                warn!(call_id = %call_id, "Device WebSocket error: {}", e);
                Some(DeviceFrame::Close)
            }
        };
        futures::future::ready(frame)
    }))
}
