//! Presence tracking
//!
//! Presence is derived from the registry's session counts. The registry
//! calls in here only when a user's count crosses 0→1 or 1→0.

use std::sync::Arc;

use tracing::{error, info};

use crate::bus::{FanoutBus, FanoutScope};
use crate::envelope::{ServerEnvelope, UserStatusData};
use crate::store::{PresenceStatus, UserStore};
use crate::types::UserId;

/// A 0↔1 crossing in a user's live session count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    /// First session opened
    Online,
    /// Last session closed
    Offline,
}

impl PresenceTransition {
    pub fn status(self) -> PresenceStatus {
        match self {
            Self::Online => PresenceStatus::Online,
            Self::Offline => PresenceStatus::Offline,
        }
    }
}

/// Persists status flips and announces them to friends
#[derive(Clone)]
pub struct PresenceTracker {
    users: Arc<dyn UserStore>,
    bus: FanoutBus,
}

impl PresenceTracker {
    pub fn new(users: Arc<dyn UserStore>, bus: FanoutBus) -> Self {
        Self { users, bus }
    }

    /// Record a transition and publish it to `user-status:<user>`
    ///
    /// Returns whether the change was published. A failed status write
    /// suppresses the broadcast.
    pub async fn on_transition(&self, user_id: UserId, transition: PresenceTransition) -> bool {
        let status = transition.status();
        if let Err(e) = self.users.update_status(user_id, status).await {
            error!("Failed to persist status {} for user {}: {}", status, user_id, e);
            return false;
        }
        info!("User {} is now {}", user_id, status);

        let envelope = ServerEnvelope::UserStatusChange {
            data: UserStatusData { user_id, status },
        };
        self.bus
            .publish(FanoutScope::UserStatus(user_id), &envelope)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::memory::InMemoryStore;
    use crate::store::UserProfile;

    fn setup() -> (Arc<InMemoryStore>, FanoutBus) {
        let store = Arc::new(InMemoryStore::new());
        store.add_user(UserProfile {
            id: UserId(1),
            username: "alice".to_string(),
            avatar: String::new(),
            status: PresenceStatus::Offline,
        });
        store.add_friendship(UserId(1), UserId(2));
        let bus = FanoutBus::new(Arc::new(MemoryBroker::new()), store.clone());
        (store, bus)
    }

    #[tokio::test]
    async fn test_online_transition_persists_and_publishes() {
        let (store, bus) = setup();
        let mut sub = bus.subscribe().await.unwrap();
        let tracker = PresenceTracker::new(store.clone(), bus);

        assert!(tracker.on_transition(UserId(1), PresenceTransition::Online).await);
        assert_eq!(store.status(UserId(1)), Some(PresenceStatus::Online));

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.channel, "user-status:1");
        let wire: Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(wire["recipients"], json!([1, 2]));
        assert_eq!(
            wire["payload"],
            json!({"type":"user_status_change","data":{"user_id":1,"status":"online"}})
        );
    }

    #[tokio::test]
    async fn test_status_write_failure_suppresses_broadcast() {
        let (store, bus) = setup();
        let mut sub = bus.subscribe().await.unwrap();
        let tracker = PresenceTracker::new(store.clone(), bus);

        store.set_unavailable(true);
        assert!(!tracker.on_transition(UserId(1), PresenceTransition::Offline).await);
        assert!(tokio::time::timeout(Duration::from_millis(50), sub.recv())
            .await
            .is_err());
    }
}
