//! Envelope protocol definitions
//!
//! JSON-based wire units using Serde's tagged enums:
//! - `ClientFrame`: client → gateway socket frames
//! - `ServerEnvelope`: gateway → client socket frames
//! - `BusEnvelope`: the unit carried across the pub/sub broker, wrapping an
//!   already-serialized `ServerEnvelope` as raw JSON

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use thiserror::Error;

use crate::store::{PresenceStatus, RoomSummary, StoredMessage};
use crate::types::{MessageId, RoomId, UserId};

/// Frame kinds a client may send
const INBOUND_KINDS: [&str; 4] = ["ping", "message", "typing", "read_receipt"];

/// Client → Gateway frame
///
/// Tagged by `type`, snake_case.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Heartbeat; answered with `pong` on the same session
    Ping,
    /// Chat message to a room
    Message {
        room_id: RoomId,
        #[serde(default)]
        content: String,
        message_type: Option<String>,
        file_url: Option<String>,
        file_name: Option<String>,
        file_size: Option<i64>,
        #[serde(default)]
        mentions: Vec<UserId>,
    },
    /// Typing indicator, `data` relayed verbatim
    Typing {
        room_id: RoomId,
        #[serde(default)]
        data: Value,
    },
    /// Read watermark advance
    ReadReceipt {
        room_id: RoomId,
        message_id: MessageId,
    },
}

/// Why an inbound frame was dropped
#[derive(Debug, Error)]
pub enum FrameRejection {
    /// Not JSON, or missing/mistyped fields for its kind
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// No string `type` discriminator
    #[error("frame has no type")]
    MissingType,

    /// `type` is not one a client may send
    #[error("unknown frame type: {0}")]
    UnknownKind(String),
}

/// Decode one socket text frame
///
/// Unknown kinds are distinguished from malformed frames so they can be
/// logged separately; both leave the connection open.
pub fn decode_frame(text: &str) -> Result<ClientFrame, FrameRejection> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameRejection::MissingType)?;
    if !INBOUND_KINDS.contains(&kind) {
        return Err(FrameRejection::UnknownKind(kind.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}

/// Envelope discriminator shared by socket frames and bus envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Message,
    Typing,
    ReadReceipt,
    UserStatusChange,
    RoomCreated,
    Ping,
    Pong,
}

/// Gateway → Client frame
///
/// Never carries a fan-out scope: the recipient is the socket itself.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// Heartbeat reply
    Pong,
    /// New persisted message
    Message { data: MessageData },
    /// Another member is typing
    Typing {
        room_id: RoomId,
        user_id: UserId,
        data: Value,
    },
    /// A member's read watermark advanced
    ReadReceipt { data: ReadReceiptData },
    /// A friend (or this user on another device) went online/offline
    UserStatusChange { data: UserStatusData },
    /// Room should (re)appear in the member's room list
    RoomCreated { data: RoomCreatedData },
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageData {
    pub message: StoredMessage,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadReceiptData {
    pub room_id: RoomId,
    pub last_read_message_id: MessageId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserStatusData {
    pub user_id: UserId,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomCreatedData {
    pub room: RoomSummary,
}

impl ServerEnvelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Pong => EnvelopeKind::Pong,
            Self::Message { .. } => EnvelopeKind::Message,
            Self::Typing { .. } => EnvelopeKind::Typing,
            Self::ReadReceipt { .. } => EnvelopeKind::ReadReceipt,
            Self::UserStatusChange { .. } => EnvelopeKind::UserStatusChange,
            Self::RoomCreated { .. } => EnvelopeKind::RoomCreated,
        }
    }

    /// Serialize to a socket text frame
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Unit carried across the pub/sub broker
///
/// `payload` is the socket frame embedded as raw JSON, not a JSON string.
/// `recipients` is filled only for user-status scopes, where the publisher
/// resolves the friend list once for every subscriber.
#[derive(Debug, Serialize, Deserialize)]
pub struct BusEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub payload: Box<RawValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<UserId>>,
}

impl BusEnvelope {
    /// Wrap a socket frame for publishing
    pub fn wrap(envelope: &ServerEnvelope) -> Result<Self, serde_json::Error> {
        Ok(Self {
            room_id: None,
            user_id: None,
            kind: envelope.kind(),
            payload: serde_json::value::to_raw_value(envelope)?,
            recipients: None,
        })
    }

    pub fn with_room(mut self, room_id: RoomId) -> Self {
        self.room_id = Some(room_id);
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_recipients(mut self, recipients: Vec<UserId>) -> Self {
        self.recipients = Some(recipients);
        self
    }

    /// Socket frame text to hand to local sessions
    pub fn payload_text(&self) -> &str {
        self.payload.get()
    }
}
