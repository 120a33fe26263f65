//! Device-facing WebSocket message types.
//!
//! Text frames are JSON objects tagged by `type`. Inbound frames are decoded
//! once at the channel boundary into [`DeviceInbound`]; frames with an
//! unrecognised `type` are kept as raw JSON so they can be echoed back.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Maximum allowed size for text payloads (50 KB)
pub const MAX_TEXT_SIZE: usize = 50 * 1024;

/// Maximum allowed size for base64 audio payloads (512 KB)
pub const MAX_AUDIO_PAYLOAD_SIZE: usize = 512 * 1024;

/// Maximum allowed size for object and event names (1 KB)
pub const MAX_NAME_SIZE: usize = 1024;

const KNOWN_TYPES: &[&str] = &[
    "connect_to_vapi",
    "audio_to_vapi",
    "audio_data",
    "text_message",
    "command",
    "auth",
    "object_pinched",
    "ar_event",
];

fn default_true() -> bool {
    true
}

fn default_object_name() -> String {
    "Unknown object".to_string()
}

fn default_event_type() -> String {
    "unknown".to_string()
}

fn default_result() -> String {
    "success".to_string()
}

// =============================================================================
// Incoming Messages (Device -> Relay)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum DeviceInbound {
    /// Attach the provider channel at an explicit URL.
    #[serde(rename = "connect_to_vapi")]
    ConnectToVapi { vapi_url: String },

    /// Base64 PCM audio (legacy JSON path).
    #[serde(rename = "audio_to_vapi", alias = "audio_data")]
    AudioToVapi { data: String },

    #[serde(rename = "text_message")]
    TextMessage {
        #[serde(alias = "message")]
        text: String,
    },

    /// Navigation request relayed to the other sessions.
    #[serde(rename = "command")]
    Command {
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        client_type: Option<String>,
    },

    #[serde(rename = "auth")]
    Auth {},

    /// The user pinched (grabbed) an object in the AR scene.
    #[serde(rename = "object_pinched")]
    ObjectPinched {
        #[serde(default = "default_object_name")]
        object_name: String,
        #[serde(default)]
        position: Option<Position>,
        #[serde(default = "default_true")]
        should_speak: bool,
        #[serde(default)]
        timestamp: Option<Value>,
        #[serde(default)]
        client_type: Option<String>,
    },

    /// Free-form AR event forwarded without step validation.
    #[serde(rename = "ar_event")]
    ArEvent {
        #[serde(default = "default_event_type")]
        event_type: String,
        #[serde(default = "default_object_name")]
        object_name: String,
        #[serde(default = "default_result")]
        result: String,
        #[serde(default)]
        should_speak: bool,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        timestamp: Option<Value>,
        #[serde(default)]
        client_type: Option<String>,
    },
}

/// Result of decoding one device text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Message(DeviceInbound),
    /// Valid JSON with an unrecognised (or missing) `type`.
    Unrecognized(Value),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceDecodeError {
    InvalidJson(String),
    InvalidFields { msg_type: String, reason: String },
    TooLarge { field: &'static str, size: usize, max: usize },
}

impl fmt::Display for DeviceDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceDecodeError::InvalidJson(_) => write!(f, "Invalid JSON format"),
            DeviceDecodeError::InvalidFields { msg_type, reason } => {
                write!(f, "Invalid {msg_type} message: {reason}")
            }
            DeviceDecodeError::TooLarge { field, size, max } => {
                write!(f, "{field} too large: {size} bytes (max {max} bytes)")
            }
        }
    }
}

impl std::error::Error for DeviceDecodeError {}

impl DeviceInbound {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<DecodedFrame, DeviceDecodeError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| DeviceDecodeError::InvalidJson(e.to_string()))?;

        let msg_type = value.get("type").and_then(Value::as_str).map(str::to_string);
        match msg_type {
            Some(msg_type) if KNOWN_TYPES.contains(&msg_type.as_str()) => {
                let message: DeviceInbound = serde_json::from_value(value).map_err(|e| {
                    DeviceDecodeError::InvalidFields {
                        msg_type: msg_type.clone(),
                        reason: e.to_string(),
                    }
                })?;
                message.validate_size()?;
                Ok(DecodedFrame::Message(message))
            }
            _ => Ok(DecodedFrame::Unrecognized(value)),
        }
    }

    /// Reject oversized payloads before they reach the session.
    pub fn validate_size(&self) -> Result<(), DeviceDecodeError> {
        let check = |field: &'static str, size: usize, max: usize| {
            if size > max {
                Err(DeviceDecodeError::TooLarge { field, size, max })
            } else {
                Ok(())
            }
        };
        match self {
            DeviceInbound::AudioToVapi { data } => check("audio data", data.len(), MAX_AUDIO_PAYLOAD_SIZE),
            DeviceInbound::TextMessage { text } => check("text", text.len(), MAX_TEXT_SIZE),
            DeviceInbound::ConnectToVapi { vapi_url } => check("vapi_url", vapi_url.len(), MAX_NAME_SIZE),
            DeviceInbound::ObjectPinched { object_name, .. } => {
                check("object_name", object_name.len(), MAX_NAME_SIZE)
            }
            DeviceInbound::ArEvent {
                event_type,
                object_name,
                ..
            } => {
                check("event_type", event_type.len(), MAX_NAME_SIZE)?;
                check("object_name", object_name.len(), MAX_NAME_SIZE)
            }
            DeviceInbound::Command { .. } | DeviceInbound::Auth {} => Ok(()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DeviceInbound::ConnectToVapi { .. } => "connect_to_vapi",
            DeviceInbound::AudioToVapi { .. } => "audio_to_vapi",
            DeviceInbound::TextMessage { .. } => "text_message",
            DeviceInbound::Command { .. } => "command",
            DeviceInbound::Auth {} => "auth",
            DeviceInbound::ObjectPinched { .. } => "object_pinched",
            DeviceInbound::ArEvent { .. } => "ar_event",
        }
    }
}

/// Training navigation requested by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationCommand {
    Next,
    Previous,
}

impl NavigationCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            NavigationCommand::Next => "next",
            NavigationCommand::Previous => "previous",
        }
    }
}

impl FromStr for NavigationCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "next" => Ok(NavigationCommand::Next),
            "previous" | "prev" => Ok(NavigationCommand::Previous),
            other => Err(format!("Unknown command: {other}")),
        }
    }
}

// =============================================================================
// Outgoing Messages (Relay -> Device)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum DeviceOutbound {
    /// Provider audio, base64 PCM, with its place on the playback timeline.
    #[serde(rename = "audio_chunk")]
    AudioChunk {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },

    /// Provider JSON forwarded verbatim.
    #[serde(rename = "vapi_message")]
    VapiMessage { data: Value },

    #[serde(rename = "vapi_connected")]
    VapiConnected {
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },

    /// Keepalive.
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "info")]
    Info { message: String },

    #[serde(rename = "echo")]
    Echo { original: Value },

    #[serde(rename = "text_response")]
    TextResponse { message: String },

    #[serde(rename = "auth")]
    Auth { status: String, message: String },

    /// Navigation broadcast (`status` absent) or acknowledgement (`status: received`).
    #[serde(rename = "command")]
    Command {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_type: Option<String>,
    },

    #[serde(rename = "step_advanced")]
    StepAdvanced {
        status: String,
        object_name: String,
        current_step: u32,
        next_instruction: String,
        expected_objects: Vec<String>,
    },

    #[serde(rename = "interaction_error")]
    InteractionError {
        status: String,
        object_name: String,
        message: String,
        current_step: u32,
        current_instruction: String,
        expected_objects: Vec<String>,
        received_object: String,
        consecutive_errors: u32,
    },

    #[serde(rename = "training_complete")]
    TrainingComplete {
        status: String,
        message: String,
        object_name: String,
    },

    /// Pinch mirrored to the other sessions with its validation verdict.
    #[serde(rename = "object_pinched")]
    ObjectPinched {
        object_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<Position>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
        client_type: String,
        validation_status: String,
        current_step: u32,
    },

    /// AR event broadcast (`status` absent) or acknowledgement (`status: received`).
    #[serde(rename = "ar_event")]
    ArEvent {
        event_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        object_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_type: Option<String>,
    },
}

impl DeviceOutbound {
    pub fn error(message: impl Into<String>) -> Self {
        DeviceOutbound::Error {
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        DeviceOutbound::Info {
            message: message.into(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DeviceOutbound::AudioChunk { .. } => "audio_chunk",
            DeviceOutbound::VapiMessage { .. } => "vapi_message",
            DeviceOutbound::VapiConnected { .. } => "vapi_connected",
            DeviceOutbound::Ping => "ping",
            DeviceOutbound::Error { .. } => "error",
            DeviceOutbound::Info { .. } => "info",
            DeviceOutbound::Echo { .. } => "echo",
            DeviceOutbound::TextResponse { .. } => "text_response",
            DeviceOutbound::Auth { .. } => "auth",
            DeviceOutbound::Command { .. } => "command",
            DeviceOutbound::StepAdvanced { .. } => "step_advanced",
            DeviceOutbound::InteractionError { .. } => "interaction_error",
            DeviceOutbound::TrainingComplete { .. } => "training_complete",
            DeviceOutbound::ObjectPinched { .. } => "object_pinched",
            DeviceOutbound::ArEvent { .. } => "ar_event",
        }
    }
}
