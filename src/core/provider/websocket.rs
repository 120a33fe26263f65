//! Provider channel over a WebSocket.
//!
//! One pump task owns the socket: it writes queued commands, answers pings and
//! hands every inbound frame to the session. The frame queue closes when the
//! socket does; dropping the command sender closes the socket.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::base::{
    ProviderChannel, ProviderError, ProviderResult, UpstreamConnector, UpstreamTarget,
};
use super::client::CallClient;
use super::messages::{ProviderCommand, ProviderFrame};

/// Capacity of the command and frame queues of one channel.
pub const CHANNEL_CAPACITY: usize = 256;

/// Connector that creates calls over HTTP and opens their WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    calls: CallClient,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(calls: CallClient, connect_timeout: Duration) -> Self {
        Self {
            calls,
            connect_timeout,
        }
    }

    /// Open `url` and start the pump task.
    pub async fn connect(
        url: &str,
        call_id: Option<String>,
        connect_timeout: Duration,
    ) -> ProviderResult<ProviderChannel> {
        let (ws_stream, _response) =
            tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| {
                    ProviderError::Timeout(format!("websocket handshake after {connect_timeout:?}"))
                })?
                .map_err(|e| ProviderError::ConnectionFailed(e.to_string()))?;

        info!(call_id = ?call_id, "Connected to voice provider");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (command_tx, mut command_rx) = mpsc::channel::<ProviderCommand>(CHANNEL_CAPACITY);
        let (frame_tx, frame_rx) = mpsc::channel::<ProviderFrame>(CHANNEL_CAPACITY);
        let log_id = call_id.clone().unwrap_or_default();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = command_rx.recv() => {
                        let message = match command {
                            Some(ProviderCommand::Audio(pcm)) => Message::Binary(pcm),
                            Some(ProviderCommand::Control(control)) => {
                                match serde_json::to_string(&control) {
                                    Ok(json) => Message::Text(json.into()),
                                    Err(e) => {
                                        warn!(call_id = %log_id, "Failed to serialize provider message: {}", e);
                                        continue;
                                    }
                                }
                            }
                            None => {
                                debug!(call_id = %log_id, "Provider command queue closed");
                                let _ = ws_sink.send(Message::Close(None)).await;
                                break;
                            }
                        };
                        if let Err(e) = ws_sink.send(message).await {
                            warn!(call_id = %log_id, "Failed to write to provider: {}", e);
                            break;
                        }
                    }

                    incoming = ws_stream.next() => {
                        let frame = match incoming {
                            Some(Ok(Message::Binary(pcm))) => ProviderFrame::Audio(pcm),
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<Value>(&text) {
                                    Ok(value) => ProviderFrame::Json(value),
                                    Err(e) => {
                                        warn!(call_id = %log_id, "Dropping non-JSON provider text: {}", e);
                                        continue;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                    warn!(call_id = %log_id, "Failed to send pong: {}", e);
                                    break;
                                }
                                continue;
                            }
                            Some(Ok(Message::Close(frame))) => {
                                info!(call_id = %log_id, reason = ?frame, "Provider closed the channel");
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                warn!(call_id = %log_id, "Provider WebSocket error: {}", e);
                                break;
                            }
                            None => {
                                info!(call_id = %log_id, "Provider stream ended");
                                break;
                            }
                        };
                        if frame_tx.send(frame).await.is_err() {
                            debug!(call_id = %log_id, "Session stopped reading provider frames");
                            let _ = ws_sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        });

        Ok(ProviderChannel {
            call_id,
            commands: command_tx,
            frames: frame_rx,
            task: Some(task),
        })
    }
}

#[async_trait]
impl UpstreamConnector for WebSocketConnector {
    async fn open(&self, target: UpstreamTarget) -> ProviderResult<ProviderChannel> {
        match target {
            UpstreamTarget::CreateCall => {
                let call = self.calls.create_call().await?;
                Self::connect(&call.websocket_call_url, Some(call.id), self.connect_timeout).await
            }
            UpstreamTarget::Url(url) => Self::connect(&url, None, self.connect_timeout).await,
        }
    }
}
