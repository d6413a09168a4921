//! Wire format of the chat backend.
//!
//! Every frame carries one JSON document with a `type` discriminator.
//! Outbound frames are either a user message or a liveness ping; inbound
//! frames decode into a [`Decoded`] value, which is either a domain event or
//! a heartbeat acknowledgment.

use crate::events::ChatEvent;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// User message sent to the backend
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatRequest {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub message: String,
    pub configuration: Map<String, Value>,
    pub context: Value,
    pub include_audio: bool,
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    body: &'a T,
    timestamp: i64,
}

#[derive(Serialize)]
struct Empty {}

/// Messages the backend can send us
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Status {
        #[serde(default)]
        message: String,
    },
    #[serde(alias = "text_delta")]
    Text {
        #[serde(alias = "delta")]
        content: String,
    },
    #[serde(alias = "audio_delta")]
    Audio {
        #[serde(alias = "audio")]
        data: String,
    },
    #[serde(alias = "complete")]
    Done,
    Interrupted,
    Error {
        #[serde(default = "default_error_message")]
        message: String,
    },
    Pong {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

fn default_error_message() -> String {
    "Unknown server error".to_string()
}

/// Result of decoding one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Heartbeat acknowledgment, consumed by the heartbeat monitor
    Ack,
    Event(ChatEvent),
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Time since a ping stamped with `sent` (epoch ms), if the stamp is not in the future
fn round_trip(sent: i64) -> Option<std::time::Duration> {
    let elapsed = now_millis().checked_sub(sent)?;
    u64::try_from(elapsed).ok().map(std::time::Duration::from_millis)
}

/// Encode a user message as one text frame
pub fn encode_request(request: &ChatRequest) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&Envelope {
        kind: "message",
        body: request,
        timestamp: now_millis(),
    })
}

/// Encode a liveness ping
pub fn encode_ping() -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&Envelope {
        kind: "ping",
        body: &Empty {},
        timestamp: now_millis(),
    })
}

/// Decode one complete inbound message.
///
/// Returns `None` for anything that does not map to a known message kind;
/// the reason is logged and the frame is dropped.
pub fn decode(payload: &[u8]) -> Option<Decoded> {
    let value: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            log::warn!("Protocol: Failed to parse message as JSON: {}", e);
            return None;
        }
    };

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("<missing>")
        .to_string();

    let message = match InboundMessage::deserialize(value) {
        Ok(message) => message,
        Err(e) => {
            log::debug!("Protocol: Dropping message of type '{}': {}", kind, e);
            return None;
        }
    };

    message.into_decoded()
}

impl InboundMessage {
    fn into_decoded(self) -> Option<Decoded> {
        let event = match self {
            InboundMessage::Pong { timestamp } => {
                match timestamp.and_then(round_trip) {
                    Some(elapsed) => log::trace!("💓 Pong after {:?}", elapsed),
                    None => log::trace!("💓 Pong"),
                }
                return Some(Decoded::Ack);
            }
            InboundMessage::Status { message } => ChatEvent::StatusMessageReceived { message },
            InboundMessage::Text { content } => ChatEvent::TextChunkReceived { chunk: content },
            InboundMessage::Audio { data } => match BASE64.decode(data.as_bytes()) {
                Ok(bytes) => ChatEvent::AudioChunkReceived { bytes },
                Err(e) => {
                    log::warn!("Protocol: Dropping audio chunk with invalid base64: {}", e);
                    return None;
                }
            },
            InboundMessage::Done => ChatEvent::ResponseCompleted,
            InboundMessage::Interrupted => ChatEvent::ResponseInterrupted,
            InboundMessage::Error { message } => ChatEvent::ErrorOccurred { message },
        };
        Some(Decoded::Event(event))
    }
}
