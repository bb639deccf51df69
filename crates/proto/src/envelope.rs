//! Envelope types for the backend channel
//!
//! All records are JSON-serialized, one per line on the wire.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DecodeError;

/// Network path the backend routes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Direct,
    Mesh,
}

impl TransportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Mesh => "mesh",
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound commands written to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Command {
    /// Enter a room, presenting the key material peers need to reach us
    Join {
        room: String,
        #[serde(rename = "preKeyBundle")]
        pre_key_bundle: Value,
        transport: TransportMode,
    },

    /// Deliver an opaque sealed payload; `id` correlates the delivery ack
    Send { id: Uuid, data: Value },

    /// Switch the backend's network path
    SetTransport { transport: TransportMode },
}

impl Command {
    /// Serialize to a single JSON line (no trailing newline)
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Inbound events read from the backend
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Handshake: the backend accepted the connection
    Connected,

    /// An envelope for the UI layer; `data` stays sealed
    Message { data: Value },

    /// Delivery acknowledgment for a previously sent message
    Delivered {
        message_id: Uuid,
        success: bool,
        reason: Option<String>,
    },

    /// Backend-reported failure, human-readable
    Error { error: String },

    /// Record of an unknown shape, forwarded upward untouched
    Unrecognized(Value),
}

#[derive(Deserialize)]
struct MessageRecord {
    data: Value,
}

#[derive(Deserialize)]
struct DeliveredRecord {
    #[serde(rename = "messageId")]
    message_id: Uuid,
    success: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorRecord {
    error: String,
}

impl Event {
    /// Decode one received line.
    ///
    /// Records with an unknown `type` (or no string `type` at all) come back
    /// as [`Event::Unrecognized`] so callers can forward them unchanged. A
    /// record whose `type` is known but whose fields do not fit is a decode
    /// error, never a panic.
    pub fn from_line(line: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(line)?;

        match value.get("type").and_then(Value::as_str) {
            Some("connected") => Ok(Event::Connected),
            Some("message") => {
                let record: MessageRecord = decode_known(value, "message")?;
                Ok(Event::Message { data: record.data })
            }
            Some("delivered") => {
                let record: DeliveredRecord = decode_known(value, "delivered")?;
                Ok(Event::Delivered {
                    message_id: record.message_id,
                    success: record.success,
                    reason: record.reason,
                })
            }
            Some("error") => {
                let record: ErrorRecord = decode_known(value, "error")?;
                Ok(Event::Error {
                    error: record.error,
                })
            }
            _ => Ok(Event::Unrecognized(value)),
        }
    }
}

fn decode_known<T: DeserializeOwned>(value: Value, kind: &'static str) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|source| DecodeError::Malformed { kind, source })
}
