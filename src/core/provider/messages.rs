//! Voice-provider channel wire types.
//!
//! Binary frames carry raw PCM in both directions. Text frames are JSON objects
//! with a `type` field; the relay produces `add-message` and `say` and
//! interprets a handful of inbound types, forwarding everything verbatim.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Outgoing (Relay -> Provider)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Control messages sent to the provider as text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProviderOutbound {
    /// Silent context injection into the conversation.
    #[serde(rename = "add-message")]
    AddMessage { message: ConversationMessage },

    /// Force the assistant to speak a line.
    #[serde(rename = "say")]
    Say { message: String },
}

impl ProviderOutbound {
    pub fn system(content: impl Into<String>) -> Self {
        ProviderOutbound::AddMessage {
            message: ConversationMessage {
                role: MessageRole::System,
                content: content.into(),
            },
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ProviderOutbound::AddMessage {
            message: ConversationMessage {
                role: MessageRole::User,
                content: content.into(),
            },
        }
    }

    pub fn say(message: impl Into<String>) -> Self {
        ProviderOutbound::Say {
            message: message.into(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ProviderOutbound::AddMessage { .. } => "add-message",
            ProviderOutbound::Say { .. } => "say",
        }
    }
}

/// Everything the relay writes to the provider channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCommand {
    Audio(Bytes),
    Control(ProviderOutbound),
}

// =============================================================================
// Incoming (Provider -> Relay)
// =============================================================================

/// A frame read from the provider channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderFrame {
    Audio(Bytes),
    Json(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechStatus {
    Started,
    Ended,
}

/// The parts of a provider JSON message the relay acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    SpeechUpdate {
        status: SpeechStatus,
        role: Option<String>,
    },
    /// The provider ended the call (`status-update` ended, `hang`).
    CallEnded { reason: Option<String> },
    /// Provider-side error report.
    Error { message: Option<String> },
    /// Audio delivered as `{"type":"audio","format":"raw","data":<base64>}`.
    LegacyAudio(Bytes),
    Other,
}

impl ProviderEvent {
    pub fn interpret(value: &Value) -> Self {
        let msg_type = value.get("type").and_then(Value::as_str).unwrap_or("");
        let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);

        match msg_type {
            "speech-update" => match value.get("status").and_then(Value::as_str) {
                Some("started") => ProviderEvent::SpeechUpdate {
                    status: SpeechStatus::Started,
                    role: field("role"),
                },
                Some("stopped") | Some("ended") => ProviderEvent::SpeechUpdate {
                    status: SpeechStatus::Ended,
                    role: field("role"),
                },
                _ => ProviderEvent::Other,
            },
            "status-update" if value.get("status").and_then(Value::as_str) == Some("ended") => {
                ProviderEvent::CallEnded {
                    reason: field("endedReason"),
                }
            }
            "hang" | "call-ended" => ProviderEvent::CallEnded {
                reason: field("reason"),
            },
            "error" => ProviderEvent::Error {
                message: field("message").or_else(|| field("error")),
            },
            "audio" if value.get("format").and_then(Value::as_str) == Some("raw") => {
                match field("data").map(|data| BASE64.decode(data.as_bytes())) {
                    Some(Ok(pcm)) => ProviderEvent::LegacyAudio(Bytes::from(pcm)),
                    _ => ProviderEvent::Other,
                }
            }
            _ => ProviderEvent::Other,
        }
    }

    /// Speech ended on the assistant side. Updates without a role count as
    /// the assistant's; a user-side speech end leaves playback alone.
    pub fn ends_assistant_turn(&self) -> bool {
        match self {
            ProviderEvent::SpeechUpdate {
                status: SpeechStatus::Ended,
                role,
            } => role.as_deref().is_none_or(|role| role == "assistant"),
            _ => false,
        }
    }
}
