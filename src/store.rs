//! Store collaborator interfaces
//!
//! The gateway never owns room membership, friend lists or message history.
//! It reads and writes them through these narrow traits, one call per
//! lookup, and never caches the results.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::types::{MessageId, RoomId, UserId};

/// Message content kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

impl MessageType {
    /// Parse a client-supplied kind; anything unrecognised is plain text
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("image") => Self::Image,
            Some("file") => Self::File,
            _ => Self::Text,
        }
    }
}

/// Persisted online/offline flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    #[default]
    Offline,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

/// Public user profile attached to broadcast messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub status: PresenceStatus,
}

/// A message as submitted by a sender, before the store assigns its id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: MessageType,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub mentions: Vec<UserId>,
}

/// A persisted message, enriched with its sender's profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
    pub room_id: RoomId,
    pub sender: UserProfile,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<UserId>,
}

/// Room kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    #[default]
    Private,
    Group,
}

/// Room as shown in a member's room list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    pub id: RoomId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RoomKind,
    pub creator_id: UserId,
    pub members: Vec<UserProfile>,
}

/// Last-read high-water mark for one (room, user) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadWatermark {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub last_read_message_id: MessageId,
    pub read_at: DateTime<Utc>,
}

/// Outcome of a watermark write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkUpdate {
    /// Stored watermark moved forward (or was created)
    Advanced(ReadWatermark),
    /// Incoming id was not newer; stored watermark is returned untouched
    Unchanged(ReadWatermark),
}

impl WatermarkUpdate {
    pub fn advanced(&self) -> bool {
        matches!(self, Self::Advanced(_))
    }

    pub fn watermark(&self) -> &ReadWatermark {
        match self {
            Self::Advanced(w) | Self::Unchanged(w) => w,
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message and return its durable identity
    async fn create(&self, message: NewMessage) -> Result<MessageId, StoreError>;

    /// Read back a persisted message with its sender profile
    async fn get_by_id(&self, id: MessageId) -> Result<StoredMessage, StoreError>;

    /// Advance the (room, user) read watermark; never moves it backwards
    async fn update_read_watermark(
        &self,
        room_id: RoomId,
        user_id: UserId,
        message_id: MessageId,
    ) -> Result<WatermarkUpdate, StoreError>;
}

#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Current member identities of a room
    async fn get_members(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError>;

    /// Set the per-member "hidden from room list" flag
    async fn set_hidden(&self, room_id: RoomId, user_id: UserId, hidden: bool)
        -> Result<(), StoreError>;

    /// Room summary used for `room_created` notifications
    async fn get_room(&self, room_id: RoomId) -> Result<RoomSummary, StoreError>;
}

#[async_trait]
pub trait FriendStore: Send + Sync {
    /// Identities of every accepted friend of `user_id`
    async fn get_friend_ids(&self, user_id: UserId) -> Result<Vec<UserId>, StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Persist the user's online/offline flag
    async fn update_status(&self, user_id: UserId, status: PresenceStatus)
        -> Result<(), StoreError>;
}
