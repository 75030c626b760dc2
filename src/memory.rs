//! In-memory store
//!
//! Reference implementation of every store collaborator trait. Backs the
//! binary when no relational store is wired in, and backs the tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;

use crate::error::{AppError, ConfigError, StoreError};
use crate::store::{
    FriendStore, MessageStore, NewMessage, PresenceStatus, ReadWatermark, RoomKind, RoomStore,
    RoomSummary, StoredMessage, UserProfile, UserStore, WatermarkUpdate,
};
use crate::types::{MessageId, RoomId, UserId};

/// Direction-specific friend record status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendStatus {
    Pending,
    Accepted,
    Blocked,
}

#[derive(Debug, Clone)]
struct FriendRecord {
    user_id: UserId,
    friend_id: UserId,
    status: FriendStatus,
}

#[derive(Debug, Clone)]
struct MemberRecord {
    user_id: UserId,
    hidden: bool,
}

#[derive(Debug, Clone)]
struct RoomRecord {
    id: RoomId,
    name: String,
    kind: RoomKind,
    creator_id: UserId,
    members: Vec<MemberRecord>,
}

#[derive(Debug, Clone)]
struct MessageRecord {
    id: MessageId,
    created_at: chrono::DateTime<Utc>,
    message: NewMessage,
}

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<UserId, UserProfile>,
    rooms: HashMap<RoomId, RoomRecord>,
    messages: HashMap<MessageId, MessageRecord>,
    next_message_id: u64,
    watermarks: HashMap<(RoomId, UserId), ReadWatermark>,
    friends: Vec<FriendRecord>,
    unavailable: bool,
}

impl Inner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            Err(StoreError::Unavailable("in-memory store offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn profile(&self, user_id: UserId) -> UserProfile {
        self.users.get(&user_id).cloned().unwrap_or_else(|| UserProfile {
            id: user_id,
            username: format!("user-{}", user_id),
            avatar: String::new(),
            status: PresenceStatus::Offline,
        })
    }
}

/// Seed data for the in-memory store
#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub users: Vec<UserProfile>,
    #[serde(default)]
    pub rooms: Vec<SeedRoom>,
    /// Accepted friendships, one pair per entry
    #[serde(default)]
    pub friendships: Vec<(UserId, UserId)>,
}

#[derive(Debug, Deserialize)]
pub struct SeedRoom {
    pub id: RoomId,
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: RoomKind,
    pub creator_id: UserId,
    pub members: Vec<UserId>,
}

/// Thread-safe in-memory implementation of all store traits
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from seed data
    pub fn from_seed(seed: Seed) -> Self {
        let store = Self::new();
        for user in seed.users {
            store.add_user(user);
        }
        for room in seed.rooms {
            store.add_room(room.id, room.name, room.kind, room.creator_id, &room.members);
        }
        for (a, b) in seed.friendships {
            store.add_friendship(a, b);
        }
        store
    }

    /// Load seed data from a JSON file
    pub fn from_seed_file(path: &str) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Seed {
            path: path.to_string(),
            source,
        })?;
        let seed: Seed = serde_json::from_str(&raw)?;
        debug!(
            "Loaded seed: {} users, {} rooms, {} friendships",
            seed.users.len(),
            seed.rooms.len(),
            seed.friendships.len()
        );
        Ok(Self::from_seed(seed))
    }

    pub fn add_user(&self, profile: UserProfile) {
        self.inner.write().users.insert(profile.id, profile);
    }

    pub fn add_room(
        &self,
        id: RoomId,
        name: impl Into<String>,
        kind: RoomKind,
        creator_id: UserId,
        members: &[UserId],
    ) {
        let record = RoomRecord {
            id,
            name: name.into(),
            kind,
            creator_id,
            members: members
                .iter()
                .map(|&user_id| MemberRecord {
                    user_id,
                    hidden: false,
                })
                .collect(),
        };
        self.inner.write().rooms.insert(id, record);
    }

    /// Record a pending request from `from` to `to`
    pub fn request_friend(&self, from: UserId, to: UserId) {
        self.inner.write().friends.push(FriendRecord {
            user_id: from,
            friend_id: to,
            status: FriendStatus::Pending,
        });
    }

    /// Accept `requester`'s pending request, writing both directions
    pub fn accept_friend(&self, user_id: UserId, requester: UserId) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.check_available()?;
        let request = inner
            .friends
            .iter_mut()
            .find(|f| {
                f.user_id == requester && f.friend_id == user_id && f.status == FriendStatus::Pending
            })
            .ok_or_else(|| StoreError::NotFound(format!("friend request {} -> {}", requester, user_id)))?;
        request.status = FriendStatus::Accepted;

        let reverse = inner
            .friends
            .iter_mut()
            .find(|f| f.user_id == user_id && f.friend_id == requester);
        match reverse {
            Some(record) => record.status = FriendStatus::Accepted,
            None => inner.friends.push(FriendRecord {
                user_id,
                friend_id: requester,
                status: FriendStatus::Accepted,
            }),
        }
        Ok(())
    }

    /// Insert an already-accepted symmetric friendship
    ///
    /// Seeding helper: replaces any records between `a` and `b` and ignores
    /// the availability switch, like `add_room`.
    pub fn add_friendship(&self, a: UserId, b: UserId) {
        let mut inner = self.inner.write();
        inner.friends.retain(|f| {
            !((f.user_id == a && f.friend_id == b) || (f.user_id == b && f.friend_id == a))
        });
        for (user_id, friend_id) in [(a, b), (b, a)] {
            inner.friends.push(FriendRecord {
                user_id,
                friend_id,
                status: FriendStatus::Accepted,
            });
        }
    }

    /// Mark the `user_id -> friend_id` direction as blocked
    pub fn block_friend(&self, user_id: UserId, friend_id: UserId) {
        let mut inner = self.inner.write();
        for record in inner
            .friends
            .iter_mut()
            .filter(|f| f.user_id == user_id && f.friend_id == friend_id)
        {
            record.status = FriendStatus::Blocked;
        }
    }

    /// Simulate the backing store going away (or coming back)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.write().unavailable = unavailable;
    }

    pub fn is_hidden(&self, room_id: RoomId, user_id: UserId) -> Option<bool> {
        self.inner
            .read()
            .rooms
            .get(&room_id)?
            .members
            .iter()
            .find(|m| m.user_id == user_id)
            .map(|m| m.hidden)
    }

    pub fn watermark(&self, room_id: RoomId, user_id: UserId) -> Option<ReadWatermark> {
        self.inner.read().watermarks.get(&(room_id, user_id)).copied()
    }

    pub fn status(&self, user_id: UserId) -> Option<PresenceStatus> {
        self.inner.read().users.get(&user_id).map(|u| u.status)
    }

    pub fn message_count(&self) -> usize {
        self.inner.read().messages.len()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn create(&self, message: NewMessage) -> Result<MessageId, StoreError> {
        let mut inner = self.inner.write();
        inner.check_available()?;
        inner.next_message_id += 1;
        let id = MessageId(inner.next_message_id);
        inner.messages.insert(
            id,
            MessageRecord {
                id,
                created_at: Utc::now(),
                message,
            },
        );
        Ok(id)
    }

    async fn get_by_id(&self, id: MessageId) -> Result<StoredMessage, StoreError> {
        let inner = self.inner.read();
        inner.check_available()?;
        let record = inner
            .messages
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("message {}", id)))?;
        let msg = &record.message;
        Ok(StoredMessage {
            id: record.id,
            created_at: record.created_at,
            room_id: msg.room_id,
            sender: inner.profile(msg.sender_id),
            content: msg.content.clone(),
            message_type: msg.message_type,
            file_url: msg.file_url.clone(),
            file_name: msg.file_name.clone(),
            file_size: msg.file_size,
            mentions: msg.mentions.clone(),
        })
    }

    async fn update_read_watermark(
        &self,
        room_id: RoomId,
        user_id: UserId,
        message_id: MessageId,
    ) -> Result<WatermarkUpdate, StoreError> {
        let mut inner = self.inner.write();
        inner.check_available()?;
        let entry = inner.watermarks.get_mut(&(room_id, user_id));
        match entry {
            Some(stored) if stored.last_read_message_id >= message_id => {
                Ok(WatermarkUpdate::Unchanged(*stored))
            }
            Some(stored) => {
                stored.last_read_message_id = message_id;
                stored.read_at = Utc::now();
                Ok(WatermarkUpdate::Advanced(*stored))
            }
            None => {
                let watermark = ReadWatermark {
                    room_id,
                    user_id,
                    last_read_message_id: message_id,
                    read_at: Utc::now(),
                };
                inner.watermarks.insert((room_id, user_id), watermark);
                Ok(WatermarkUpdate::Advanced(watermark))
            }
        }
    }
}

#[async_trait]
impl RoomStore for InMemoryStore {
    async fn get_members(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError> {
        let inner = self.inner.read();
        inner.check_available()?;
        let room = inner
            .rooms
            .get(&room_id)
            .ok_or_else(|| StoreError::NotFound(format!("room {}", room_id)))?;
        Ok(room.members.iter().map(|m| m.user_id).collect())
    }

    async fn set_hidden(
        &self,
        room_id: RoomId,
        user_id: UserId,
        hidden: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.check_available()?;
        if let Some(member) = inner
            .rooms
            .get_mut(&room_id)
            .and_then(|r| r.members.iter_mut().find(|m| m.user_id == user_id))
        {
            member.hidden = hidden;
        }
        Ok(())
    }

    async fn get_room(&self, room_id: RoomId) -> Result<RoomSummary, StoreError> {
        let inner = self.inner.read();
        inner.check_available()?;
        let room = inner
            .rooms
            .get(&room_id)
            .ok_or_else(|| StoreError::NotFound(format!("room {}", room_id)))?;
        Ok(RoomSummary {
            id: room.id,
            name: room.name.clone(),
            kind: room.kind,
            creator_id: room.creator_id,
            members: room.members.iter().map(|m| inner.profile(m.user_id)).collect(),
        })
    }
}

#[async_trait]
impl FriendStore for InMemoryStore {
    async fn get_friend_ids(&self, user_id: UserId) -> Result<Vec<UserId>, StoreError> {
        let inner = self.inner.read();
        inner.check_available()?;
        Ok(inner
            .friends
            .iter()
            .filter(|f| f.user_id == user_id && f.status == FriendStatus::Accepted)
            .map(|f| f.friend_id)
            .collect())
    }
}

#[async_trait]
impl UserStore for InMemoryStore {
    async fn update_status(
        &self,
        user_id: UserId,
        status: PresenceStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.check_available()?;
        // unknown users are a no-op, matching an UPDATE that hits no row
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.status = status;
        }
        Ok(())
    }
}
