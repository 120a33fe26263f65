//! Per-call relay session.
//!
//! A session bridges one device channel and at most one provider channel.
//! Device frames are handled on the session's own loop; provider frames are
//! handled by a forwarding task that owns the jitter buffer. A keepalive task
//! pings the device. Every task shares one cancellation token, and teardown
//! runs exactly once whichever side triggers it.
//!
//! ```text
//!  Connecting ──provider attached──▶ Active ──either side closes──▶ Closing ──▶ Closed
//!      │                                                              ▲
//!      └──────────────── upstream unavailable (error sent) ───────────┘
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{DecodedFrame, DeviceInbound, DeviceOutbound, NavigationCommand, Position};
use super::policy::{AudioDelivery, RelayPolicy, UpstreamMode};
use super::registry::{DeviceRoute, SessionHandle, SessionKind, SessionRegistry};
use crate::core::audio::{JitterBuffer, PlaybackClock};
use crate::core::bridge::{BridgeEvent, EventBridge};
use crate::core::provider::{
    ProviderChannel, ProviderCommand, ProviderError, ProviderEvent, ProviderFrame,
    ProviderOutbound, SharedConnector, UpstreamTarget,
};
use crate::core::training::{InteractionEvent, StepValidator, TrainingScenario, ValidationOutcome};
use crate::errors::{RelayError, RelayResult};
use crate::utils::validate_upstream_url;

/// How long the provider pump gets to send its close frame.
const PROVIDER_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Device text frames held while the provider call is being created.
const PENDING_TEXT_LIMIT: usize = 32;

/// One frame read from the device transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFrame {
    Text(String),
    Binary(Bytes),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Connecting => write!(f, "connecting"),
            SessionPhase::Active => write!(f, "active"),
            SessionPhase::Closing => write!(f, "closing"),
            SessionPhase::Closed => write!(f, "closed"),
        }
    }
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub registry: SessionRegistry,
    pub connector: SharedConnector,
    pub scenario: Arc<TrainingScenario>,
}

pub struct RelaySession {
    call_id: String,
    policy: RelayPolicy,
    deps: SessionDeps,
    device_tx: mpsc::Sender<DeviceRoute>,
    provider_tx: Option<mpsc::Sender<ProviderCommand>>,
    provider_task: Option<JoinHandle<()>>,
    forward_task: Option<JoinHandle<()>>,
    keepalive_task: Option<JoinHandle<()>>,
    validator: StepValidator,
    bridge: EventBridge,
    clock: PlaybackClock,
    phase: watch::Sender<SessionPhase>,
    cancel: CancellationToken,
    registered: bool,
    torn_down: bool,
}

impl RelaySession {
    pub fn new(
        call_id: impl Into<String>,
        policy: RelayPolicy,
        deps: SessionDeps,
        device_tx: mpsc::Sender<DeviceRoute>,
    ) -> Self {
        let validator = StepValidator::new(deps.scenario.clone(), policy.match_policy);
        let (phase, _) = watch::channel(SessionPhase::Connecting);
        Self {
            call_id: call_id.into(),
            policy,
            deps,
            device_tx,
            provider_tx: None,
            provider_task: None,
            forward_task: None,
            keepalive_task: None,
            validator,
            bridge: EventBridge::new(),
            clock: PlaybackClock::start(),
            phase,
            cancel: CancellationToken::new(),
            registered: false,
            torn_down: false,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    /// Cancelling this token ends the session (explicit disconnect).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn validator(&self) -> &StepValidator {
        &self.validator
    }

    pub fn is_provider_attached(&self) -> bool {
        self.provider_tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Drive the session until either channel closes or it is cancelled.
    pub async fn run<S>(&mut self, mut inbound: S)
    where
        S: Stream<Item = DeviceFrame> + Unpin + Send,
    {
        let handle = SessionHandle::new(&self.call_id, self.policy.kind, self.device_tx.clone())
            .with_observer_target(self.policy.observer_target.clone())
            .with_cancel(self.cancel.clone());
        if let Err(err) = self.deps.registry.register(handle) {
            warn!(call_id = %self.call_id, "{err}");
            let _ = self.send_device(DeviceOutbound::error(err.to_string())).await;
            self.teardown().await;
            return;
        }
        self.registered = true;
        info!(call_id = %self.call_id, kind = %self.policy.kind, "Session started");

        self.spawn_keepalive();

        if self.policy.is_observer() {
            self.set_phase(SessionPhase::Active);
            if self
                .send_device(DeviceOutbound::info("Connected to AR event relay"))
                .await
                .is_err()
            {
                self.teardown().await;
                return;
            }
        } else if self.policy.upstream == UpstreamMode::CreateCall {
            let (attached, pending) = self.attach_while_polling(&mut inbound).await;
            if let Err(err) = attached {
                self.report(err).await;
                self.teardown().await;
                return;
            }
            for text in pending {
                if let Err(err) = self.handle_text(&text).await
                    && !self.report(err).await
                {
                    self.teardown().await;
                    return;
                }
            }
        }

        let deadline = Instant::now() + self.policy.connect_timeout;
        let cancel = self.cancel.clone();
        loop {
            let awaiting_upstream = self.awaiting_device_upstream();
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(call_id = %self.call_id, "Session cancelled");
                    break;
                }
                _ = tokio::time::sleep_until(deadline), if awaiting_upstream => {
                    let err = RelayError::from(ProviderError::Timeout(
                        "no connect_to_vapi received".to_string(),
                    ));
                    self.report(err).await;
                    break;
                }
                frame = inbound.next() => {
                    let result = match frame {
                        Some(DeviceFrame::Text(text)) => self.handle_text(&text).await,
                        Some(DeviceFrame::Binary(pcm)) => self.forward_device_audio(pcm).await,
                        Some(DeviceFrame::Close) | None => Err(RelayError::device_closed()),
                    };
                    if let Err(err) = result
                        && !self.report(err).await
                    {
                        break;
                    }
                }
            }
        }

        self.teardown().await;
    }

    /// Close both channels, stop every task and leave the registry. Safe to
    /// call more than once.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.set_phase(SessionPhase::Closing);
        self.cancel.cancel();

        if let Some(task) = self.keepalive_task.take() {
            task.abort();
        }
        if let Some(task) = self.forward_task.take() {
            task.abort();
        }
        if self.registered {
            self.deps
                .registry
                .unregister_if_same(&self.call_id, &self.device_tx);
            self.registered = false;
        }

        // Last command sender gone: the pump sends a close frame and exits.
        self.provider_tx = None;
        if let Some(mut task) = self.provider_task.take()
            && tokio::time::timeout(PROVIDER_CLOSE_GRACE, &mut task).await.is_err()
        {
            task.abort();
        }

        let _ = self.device_tx.try_send(DeviceRoute::Close);
        self.set_phase(SessionPhase::Closed);
        info!(
            call_id = %self.call_id,
            current_step = self.validator.current_step(),
            "Session closed"
        );
    }

    // =========================================================================
    // Lifecycle helpers
    // =========================================================================

    fn set_phase(&self, phase: SessionPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(call_id = %self.call_id, from = %previous, to = %phase, "Session phase changed");
        }
    }

    fn awaiting_device_upstream(&self) -> bool {
        !self.policy.is_observer()
            && self.policy.upstream == UpstreamMode::ClientSupplied
            && self.provider_tx.is_none()
    }

    fn spawn_keepalive(&mut self) {
        let device_tx = self.device_tx.clone();
        let cancel = self.cancel.clone();
        let call_id = self.call_id.clone();
        let period = self.policy.keepalive_interval;

        self.keepalive_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if device_tx.send(DeviceRoute::Outgoing(DeviceOutbound::Ping)).await.is_err() {
                            info!(call_id = %call_id, "Keepalive failed, device channel gone");
                            cancel.cancel();
                            break;
                        }
                        debug!(call_id = %call_id, direction = "relay->device", msg_type = "ping", "Keepalive sent");
                    }
                }
            }
        }));
    }

    /// Create the provider call while still watching the device, so a device
    /// that leaves mid-connect ends the attempt. Text frames that arrive in the
    /// meantime are returned for handling once the call is up; audio is
    /// dropped as there is nowhere to send it yet.
    async fn attach_while_polling<S>(&mut self, inbound: &mut S) -> (RelayResult<()>, Vec<String>)
    where
        S: Stream<Item = DeviceFrame> + Unpin + Send,
    {
        let cancel = self.cancel.clone();
        let call_id = self.call_id.clone();
        let mut pending = Vec::new();

        let attach = self.attach_provider(UpstreamTarget::CreateCall);
        tokio::pin!(attach);
        let result = loop {
            tokio::select! {
                result = &mut attach => break result,
                _ = cancel.cancelled() => break Err(RelayError::device_closed()),
                frame = inbound.next() => match frame {
                    Some(DeviceFrame::Text(text)) if pending.len() < PENDING_TEXT_LIMIT => pending.push(text),
                    Some(DeviceFrame::Text(_)) => {
                        warn!(call_id = %call_id, "Too many messages while connecting, message dropped");
                    }
                    Some(DeviceFrame::Binary(pcm)) => {
                        debug!(call_id = %call_id, len = pcm.len(), "No provider channel yet, device audio dropped");
                    }
                    Some(DeviceFrame::Close) | None => break Err(RelayError::device_closed()),
                },
            }
        };
        (result, pending)
    }

    async fn attach_provider(&mut self, target: UpstreamTarget) -> RelayResult<()> {
        let limit = self.policy.connect_timeout;
        let channel = match tokio::time::timeout(limit, self.deps.connector.open(target)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProviderError::Timeout(format!(
                    "provider channel not ready after {}s",
                    limit.as_secs()
                ))
                .into());
            }
        };

        let ProviderChannel {
            call_id: upstream_call_id,
            commands,
            frames,
            task,
        } = channel;

        self.deps.registry.attach_provider(&self.call_id, commands.clone());
        self.provider_tx = Some(commands);
        self.provider_task = task;

        let forwarder = ProviderForwarder {
            call_id: self.call_id.clone(),
            device_tx: self.device_tx.clone(),
            registry: self.deps.registry.clone(),
            jitter: JitterBuffer::new(self.policy.jitter),
            clock: self.clock,
            delivery: self.policy.audio_delivery,
            cancel: self.cancel.clone(),
        };
        self.forward_task = Some(tokio::spawn(forwarder.run(frames)));

        self.set_phase(SessionPhase::Active);
        info!(
            call_id = %self.call_id,
            upstream_call_id = upstream_call_id.as_deref().unwrap_or("-"),
            "Provider channel attached"
        );
        self.send_device(DeviceOutbound::VapiConnected {
            call_id: upstream_call_id,
        })
        .await
    }

    /// Log `err` and tell the device. Returns whether the session continues.
    async fn report(&mut self, err: RelayError) -> bool {
        match &err {
            RelayError::ChannelClosed { .. } => {
                info!(call_id = %self.call_id, "{err}");
                return false;
            }
            RelayError::UpstreamUnavailable(_) => {
                warn!(call_id = %self.call_id, error = %err, "Upstream unavailable");
            }
            RelayError::MalformedMessage(_) => {
                warn!(call_id = %self.call_id, error = %err, "Dropped malformed device message");
            }
            RelayError::Rejected(_) | RelayError::AudioOverrun { .. } => {
                debug!(call_id = %self.call_id, error = %err, "Request rejected");
            }
        }
        let delivered = self
            .send_device(DeviceOutbound::error(err.to_string()))
            .await
            .is_ok();
        delivered && !err.is_fatal()
    }

    async fn send_device(&self, message: DeviceOutbound) -> RelayResult<()> {
        debug!(
            call_id = %self.call_id,
            direction = "relay->device",
            msg_type = message.type_name(),
            "Device message"
        );
        self.device_tx
            .send(DeviceRoute::Outgoing(message))
            .await
            .map_err(|_| RelayError::device_closed())
    }

    /// Send conversation updates to this session's provider, or for observers
    /// to the target relay's. Returns false when nothing could be delivered.
    async fn route_to_provider(&self, messages: Vec<ProviderOutbound>) -> bool {
        let provider = match self.policy.kind {
            SessionKind::Relay => self.provider_tx.clone(),
            SessionKind::Observer => self
                .deps
                .registry
                .provider_for(self.policy.observer_target.as_deref())
                .map(|(_, tx)| tx),
        };
        let Some(provider) = provider else {
            debug!(call_id = %self.call_id, "No provider channel, conversation update skipped");
            return false;
        };

        for message in messages {
            debug!(
                call_id = %self.call_id,
                direction = "relay->provider",
                msg_type = message.type_name(),
                "Provider message"
            );
            if provider.send(ProviderCommand::Control(message)).await.is_err() {
                warn!(call_id = %self.call_id, "Provider channel closed during conversation update");
                return false;
            }
        }
        true
    }

    // =========================================================================
    // Device -> provider
    // =========================================================================

    async fn forward_device_audio(&mut self, pcm: Bytes) -> RelayResult<()> {
        let Some(provider) = &self.provider_tx else {
            debug!(call_id = %self.call_id, len = pcm.len(), "No provider channel, device audio dropped");
            return Ok(());
        };
        provider
            .send(ProviderCommand::Audio(pcm))
            .await
            .map_err(|_| RelayError::provider_closed())
    }

    async fn handle_text(&mut self, text: &str) -> RelayResult<()> {
        let message = match DeviceInbound::decode(text)? {
            DecodedFrame::Message(message) => message,
            DecodedFrame::Unrecognized(original) => {
                debug!(call_id = %self.call_id, direction = "device->relay", msg_type = "unknown", "Echoing message");
                return self.send_device(DeviceOutbound::Echo { original }).await;
            }
        };
        debug!(
            call_id = %self.call_id,
            direction = "device->relay",
            msg_type = message.type_name(),
            "Device message"
        );

        match message {
            DeviceInbound::ConnectToVapi { vapi_url } => self.handle_connect(&vapi_url).await,
            DeviceInbound::AudioToVapi { data } => self.handle_encoded_audio(&data).await,
            DeviceInbound::TextMessage { text } => self.handle_text_message(text).await,
            DeviceInbound::Command {
                command,
                client_type,
            } => self.handle_command(command, client_type).await,
            DeviceInbound::Auth {} => {
                self.send_device(DeviceOutbound::Auth {
                    status: "success".to_string(),
                    message: "Authentication successful".to_string(),
                })
                .await
            }
            DeviceInbound::ObjectPinched {
                object_name,
                position,
                should_speak,
                timestamp,
                client_type,
            } => {
                self.handle_pinch(object_name, position, should_speak, timestamp, client_type)
                    .await
            }
            DeviceInbound::ArEvent {
                event_type,
                object_name,
                result,
                should_speak,
                data,
                client_type,
                ..
            } => {
                self.handle_ar_event(event_type, object_name, result, should_speak, data, client_type)
                    .await
            }
        }
    }

    async fn handle_connect(&mut self, vapi_url: &str) -> RelayResult<()> {
        if self.policy.is_observer() {
            return Err(RelayError::rejected(
                "Observer sessions do not open a voice provider channel",
            ));
        }
        if self.provider_tx.is_some() {
            return Err(RelayError::rejected("Already connected to voice provider"));
        }
        let url = validate_upstream_url(vapi_url, self.policy.allow_insecure_upstream)
            .map_err(|e| RelayError::rejected(format!("Invalid vapi_url: {e}")))?;
        self.attach_provider(UpstreamTarget::Url(url.to_string())).await
    }

    async fn handle_encoded_audio(&mut self, data: &str) -> RelayResult<()> {
        let Some(provider) = self.provider_tx.clone() else {
            return Err(RelayError::rejected("Not connected to Vapi"));
        };
        let pcm = BASE64
            .decode(data.as_bytes())
            .map_err(|_| RelayError::rejected("Invalid audio payload"))?;
        provider
            .send(ProviderCommand::Audio(Bytes::from(pcm)))
            .await
            .map_err(|_| RelayError::provider_closed())
    }

    async fn handle_text_message(&mut self, text: String) -> RelayResult<()> {
        self.route_to_provider(vec![ProviderOutbound::user(text.clone())])
            .await;
        self.send_device(DeviceOutbound::TextResponse {
            message: format!("Received: {text}"),
        })
        .await
    }

    async fn handle_command(
        &mut self,
        command: Option<String>,
        client_type: Option<String>,
    ) -> RelayResult<()> {
        let Some(raw) = command else {
            return Err(RelayError::rejected("No command specified"));
        };
        let command: NavigationCommand = raw.parse().map_err(RelayError::Rejected)?;

        self.deps.registry.broadcast(
            &DeviceOutbound::Command {
                command: command.as_str().to_string(),
                status: None,
                client_type: Some(client_type.unwrap_or_else(|| "unknown".to_string())),
            },
            Some(&self.call_id),
        );
        self.send_device(DeviceOutbound::Command {
            command: command.as_str().to_string(),
            status: Some("received".to_string()),
            client_type: None,
        })
        .await
    }

    async fn handle_pinch(
        &mut self,
        object_name: String,
        position: Option<Position>,
        should_speak: bool,
        timestamp: Option<Value>,
        client_type: Option<String>,
    ) -> RelayResult<()> {
        let mut event = InteractionEvent::new(&object_name, "pinch");
        event.timestamp = timestamp.as_ref().and_then(Value::as_f64);

        let outcome = self.validator.validate(&event);
        let bridge_event = BridgeEvent::from_outcome(&object_name, &outcome, &self.validator);
        let checked_step = self.validator.current_step();

        let reply = match &outcome {
            ValidationOutcome::Valid { step, .. } => {
                info!(call_id = %self.call_id, step, object = %object_name, "Training step completed");
                if self.validator.advance() {
                    DeviceOutbound::TrainingComplete {
                        status: "completed".to_string(),
                        message: completion_message(self.validator.scenario()),
                        object_name: object_name.clone(),
                    }
                } else {
                    let (next_instruction, expected_objects) = self
                        .validator
                        .current()
                        .map(|step| (step.description.clone(), step.expected_objects.clone()))
                        .unwrap_or_default();
                    DeviceOutbound::StepAdvanced {
                        status: "correct".to_string(),
                        object_name: object_name.clone(),
                        current_step: self.validator.current_step(),
                        next_instruction,
                        expected_objects,
                    }
                }
            }
            ValidationOutcome::Invalid {
                reason,
                expected_objects,
                current_description,
                received_object,
            } => {
                debug!(call_id = %self.call_id, reason = %reason, "Interaction rejected");
                let message = if expected_objects.is_empty() {
                    reason.clone()
                } else {
                    format!("Wrong object! Expected: {}", expected_objects.join(", "))
                };
                DeviceOutbound::InteractionError {
                    status: "incorrect".to_string(),
                    object_name: object_name.clone(),
                    message,
                    current_step: self.validator.current_step(),
                    current_instruction: current_description.clone(),
                    expected_objects: expected_objects.clone(),
                    received_object: received_object.clone(),
                    consecutive_errors: self.validator.consecutive_errors(),
                }
            }
        };

        let messages = self.bridge.on_validated_event(&bridge_event, should_speak);
        self.route_to_provider(messages).await;

        let validation_status = if outcome.is_valid() { "correct" } else { "incorrect" };
        self.deps.registry.broadcast(
            &DeviceOutbound::ObjectPinched {
                object_name,
                position,
                timestamp,
                client_type: client_type.unwrap_or_else(|| "unknown".to_string()),
                validation_status: validation_status.to_string(),
                current_step: checked_step,
            },
            Some(&self.call_id),
        );

        self.send_device(reply).await
    }

    async fn handle_ar_event(
        &mut self,
        event_type: String,
        object_name: String,
        result: String,
        should_speak: bool,
        data: Value,
        client_type: Option<String>,
    ) -> RelayResult<()> {
        let bridge_event = BridgeEvent::device(&event_type, &object_name, &result);
        let messages = self.bridge.on_validated_event(&bridge_event, should_speak);
        self.route_to_provider(messages).await;

        self.deps.registry.broadcast(
            &DeviceOutbound::ArEvent {
                event_type: event_type.clone(),
                status: None,
                object_name: Some(object_name),
                result: Some(result),
                data: (!data.is_null()).then_some(data),
                client_type: Some(client_type.unwrap_or_else(|| "unknown".to_string())),
            },
            Some(&self.call_id),
        );

        self.send_device(DeviceOutbound::ArEvent {
            event_type,
            status: Some("received".to_string()),
            object_name: None,
            result: None,
            data: None,
            client_type: None,
        })
        .await
    }
}

impl fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySession")
            .field("call_id", &self.call_id)
            .field("kind", &self.policy.kind)
            .field("phase", &self.phase())
            .field("provider_attached", &self.is_provider_attached())
            .finish()
    }
}

/// "fire_emergency" becomes "Fire emergency training completed successfully!".
fn completion_message(scenario: &TrainingScenario) -> String {
    let title = scenario.name.replace(['_', '-'], " ");
    let mut chars = title.trim().chars();
    let title: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Training".to_string(),
    };
    format!("{title} training completed successfully!")
}

// =============================================================================
// Provider -> device
// =============================================================================

/// Owns the jitter buffer; runs until the provider channel closes, the call
/// ends or the session is cancelled, then cancels the session.
struct ProviderForwarder {
    call_id: String,
    device_tx: mpsc::Sender<DeviceRoute>,
    registry: SessionRegistry,
    jitter: JitterBuffer,
    clock: PlaybackClock,
    delivery: AudioDelivery,
    cancel: CancellationToken,
}

impl ProviderForwarder {
    async fn run(mut self, mut frames: mpsc::Receiver<ProviderFrame>) {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = frames.recv() => frame,
            };
            let Some(frame) = frame else {
                info!(call_id = %self.call_id, "provider channel closed");
                break;
            };
            let keep_going = match frame {
                ProviderFrame::Audio(pcm) => self.deliver_audio(pcm).await,
                ProviderFrame::Json(value) => self.deliver_json(value).await,
            };
            if !keep_going {
                break;
            }
        }

        let stats = self.jitter.stats();
        debug!(
            call_id = %self.call_id,
            frames_scheduled = stats.frames_scheduled,
            frames_dropped = stats.frames_dropped,
            resnaps = stats.resnaps,
            turns = stats.turns,
            "Provider forwarding stopped"
        );
        self.cancel.cancel();
    }

    async fn deliver_audio(&mut self, pcm: Bytes) -> bool {
        let Some(placed) = self.jitter.schedule_pcm(pcm.clone(), self.clock.now()) else {
            debug!(call_id = %self.call_id, len = pcm.len(), "Dropped malformed provider audio frame");
            return true;
        };

        let route = match self.delivery {
            AudioDelivery::Json => DeviceRoute::Outgoing(DeviceOutbound::AudioChunk {
                data: BASE64.encode(&pcm),
                start_ms: Some(placed.start_time.as_millis() as u64),
                duration_ms: Some(placed.duration.as_millis() as u64),
            }),
            AudioDelivery::Binary => DeviceRoute::Audio(pcm),
        };
        self.device_tx.send(route).await.is_ok()
    }

    async fn deliver_json(&mut self, value: Value) -> bool {
        let event = ProviderEvent::interpret(&value);
        match &event {
            ProviderEvent::LegacyAudio(pcm) => return self.deliver_audio(pcm.clone()).await,
            ProviderEvent::Error { message } => {
                warn!(call_id = %self.call_id, message = message.as_deref().unwrap_or(""), "Provider reported an error");
            }
            speech if speech.ends_assistant_turn() => self.jitter.end_turn(self.clock.now()),
            _ => {}
        }

        let msg_type = value.get("type").and_then(Value::as_str).unwrap_or("unknown");
        debug!(
            call_id = %self.call_id,
            direction = "provider->device",
            msg_type,
            "Provider message"
        );
        let message = DeviceOutbound::VapiMessage { data: value };
        if self
            .device_tx
            .send(DeviceRoute::Outgoing(message.clone()))
            .await
            .is_err()
        {
            return false;
        }
        self.registry.mirror_to_observers(&self.call_id, &message);

        if let ProviderEvent::CallEnded { reason } = event {
            info!(call_id = %self.call_id, reason = reason.as_deref().unwrap_or("unknown"), "Provider ended the call");
            return false;
        }
        true
    }
}
