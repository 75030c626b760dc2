//! Cross-process fan-out bus
//!
//! Every gateway publishes envelopes to a shared broker under a scope
//! channel and runs one delivery loop that receives every scope channel,
//! resolves recipients and hands the frame to its local registry.
//!
//! Recipients are resolved late:
//! - `room:<id>`: each subscriber reads current membership on receipt
//! - `user-status:<id>`: the publisher reads the friend list once and ships
//!   it inside the envelope

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerMessage, Subscription};
use crate::envelope::{BusEnvelope, EnvelopeKind, ServerEnvelope};
use crate::error::BrokerError;
use crate::session::Outbound;
use crate::store::{FriendStore, RoomStore};
use crate::types::{RoomId, UserId};

const ROOM_PREFIX: &str = "room:";
const USER_STATUS_PREFIX: &str = "user-status:";

/// First wait before reopening a lost subscription
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound for the resubscribe wait
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Addressable fan-out target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FanoutScope {
    /// All current members of a room
    Room(RoomId),
    /// A user's friends plus the user
    UserStatus(UserId),
}

impl FanoutScope {
    /// Patterns covering every scope channel
    pub const PATTERNS: [&'static str; 2] = ["room:*", "user-status:*"];

    /// Broker channel name
    pub fn channel(&self) -> String {
        match self {
            Self::Room(id) => format!("{}{}", ROOM_PREFIX, id),
            Self::UserStatus(id) => format!("{}{}", USER_STATUS_PREFIX, id),
        }
    }

    /// Parse a broker channel name back into a scope
    pub fn parse(channel: &str) -> Option<Self> {
        if let Some(id) = channel.strip_prefix(ROOM_PREFIX) {
            return id.parse().ok().map(|id| Self::Room(RoomId(id)));
        }
        if let Some(id) = channel.strip_prefix(USER_STATUS_PREFIX) {
            return id.parse().ok().map(|id| Self::UserStatus(UserId(id)));
        }
        None
    }
}

impl std::fmt::Display for FanoutScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.channel())
    }
}

/// Local hand-off for delivered frames
///
/// Implemented by the registry handle; returns how many sessions accepted
/// the frame.
pub trait LocalDelivery: Send + Sync {
    fn send_to_user(&self, user_id: UserId, frame: Outbound) -> usize;
}

/// Publishing side of the bus
#[derive(Clone)]
pub struct FanoutBus {
    broker: Arc<dyn Broker>,
    friends: Arc<dyn FriendStore>,
}

impl FanoutBus {
    pub fn new(broker: Arc<dyn Broker>, friends: Arc<dyn FriendStore>) -> Self {
        Self { broker, friends }
    }

    /// Publish `envelope` to `scope`
    ///
    /// Broker failures are logged and swallowed; the return value only
    /// reports whether the broker accepted the envelope.
    pub async fn publish(&self, scope: FanoutScope, envelope: &ServerEnvelope) -> bool {
        let bus_envelope = match self.build(scope, envelope).await {
            Ok(e) => e,
            Err(e) => {
                error!("Failed to encode {:?} for {}: {}", envelope.kind(), scope, e);
                return false;
            }
        };
        let payload = match serde_json::to_string(&bus_envelope) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize bus envelope for {}: {}", scope, e);
                return false;
            }
        };

        match self.broker.publish(&scope.channel(), payload).await {
            Ok(()) => {
                debug!("Published {:?} to {}", bus_envelope.kind, scope);
                true
            }
            Err(e) => {
                error!("Publish to {} via {} failed: {}", scope, self.broker.name(), e);
                false
            }
        }
    }

    async fn build(
        &self,
        scope: FanoutScope,
        envelope: &ServerEnvelope,
    ) -> Result<BusEnvelope, serde_json::Error> {
        let mut bus_envelope = BusEnvelope::wrap(envelope)?;
        if let ServerEnvelope::Typing { user_id, .. } = envelope {
            bus_envelope = bus_envelope.with_user(*user_id);
        }

        Ok(match scope {
            FanoutScope::Room(room_id) => bus_envelope.with_room(room_id),
            FanoutScope::UserStatus(user_id) => {
                let recipients = self.status_recipients(user_id).await;
                bus_envelope.with_user(user_id).with_recipients(recipients)
            }
        })
    }

    /// Friends plus the user itself, so its other devices see the change
    async fn status_recipients(&self, user_id: UserId) -> Vec<UserId> {
        let mut recipients = match self.friends.get_friend_ids(user_id).await {
            Ok(friends) => friends,
            Err(e) => {
                warn!("Friend lookup for {} failed, notifying self only: {}", user_id, e);
                Vec::new()
            }
        };
        recipients.push(user_id);
        recipients.sort_unstable();
        recipients.dedup();
        recipients
    }

    /// Open the process-wide subscription over every scope channel
    pub async fn subscribe(&self) -> Result<Subscription, BrokerError> {
        let subscription = self.broker.psubscribe(&FanoutScope::PATTERNS).await?;
        info!(
            "Subscribed to {} via {} broker",
            FanoutScope::PATTERNS.join(", "),
            self.broker.name()
        );
        Ok(subscription)
    }
}

/// Receiving side of the bus, one per process
pub struct Delivery<D> {
    rooms: Arc<dyn RoomStore>,
    local: D,
}

impl<D: LocalDelivery> Delivery<D> {
    pub fn new(rooms: Arc<dyn RoomStore>, local: D) -> Self {
        Self { rooms, local }
    }

    /// Run for the life of the process
    ///
    /// A closed subscription is reopened through `bus` with exponential
    /// backoff; events published while it is down are lost.
    pub async fn run(self, bus: FanoutBus, mut subscription: Subscription) {
        loop {
            while let Some(msg) = subscription.recv().await {
                self.deliver(msg).await;
            }
            warn!("Fan-out subscription closed, resubscribing");
            subscription = resubscribe(&bus).await;
        }
    }

    /// Deliver one broker message; returns the number of users addressed
    pub async fn deliver(&self, msg: BrokerMessage) -> usize {
        let Some(scope) = FanoutScope::parse(&msg.channel) else {
            warn!("Ignoring message on unknown channel {}", msg.channel);
            return 0;
        };
        let envelope: BusEnvelope = match serde_json::from_str(&msg.payload) {
            Ok(e) => e,
            Err(e) => {
                error!("Failed to decode bus envelope on {}: {}", msg.channel, e);
                return 0;
            }
        };
        let frame: Outbound = Arc::from(envelope.payload_text());

        let recipients = match scope {
            FanoutScope::Room(room_id) => match self.rooms.get_members(room_id).await {
                Ok(members) => {
                    // typing never echoes back to its sender
                    let exclude = match envelope.kind {
                        EnvelopeKind::Typing => envelope.user_id,
                        _ => None,
                    };
                    members
                        .into_iter()
                        .filter(|m| Some(*m) != exclude)
                        .collect()
                }
                Err(e) => {
                    error!("Failed to resolve members of room {}: {}", room_id, e);
                    return 0;
                }
            },
            FanoutScope::UserStatus(user_id) => {
                envelope.recipients.unwrap_or_else(|| vec![user_id])
            }
        };

        let mut sessions = 0;
        for user_id in &recipients {
            sessions += self.local.send_to_user(*user_id, frame.clone());
        }
        debug!(
            "Delivered {:?} on {} to {} users ({} local sessions)",
            envelope.kind,
            scope,
            recipients.len(),
            sessions
        );
        recipients.len()
    }
}

async fn resubscribe(bus: &FanoutBus) -> Subscription {
    let mut backoff = RESUBSCRIBE_BACKOFF;
    loop {
        tokio::time::sleep(backoff).await;
        match bus.subscribe().await {
            Ok(subscription) => return subscription,
            Err(e) => {
                backoff = (backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);
                warn!("Resubscribe failed, next attempt in {:?}: {}", backoff, e);
            }
        }
    }
}
