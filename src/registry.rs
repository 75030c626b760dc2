//! ConnectionRegistry actor implementation
//!
//! The registry owns the map from user identity to live sessions. Every
//! structural change (register, unregister) and every inbound event goes
//! through one control loop fed by an mpsc channel, so the loop is the
//! only writer of the map. Delivery reads the map concurrently from the bus
//! under a read lock and never blocks on a session.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::LocalDelivery;
use crate::envelope::ClientFrame;
use crate::error::{AppError, SendError};
use crate::presence::{PresenceTracker, PresenceTransition};
use crate::router::EventRouter;
use crate::session::{Outbound, Session, SessionRef};
use crate::types::{SessionId, UserId};

/// user → (session id → session); a user key exists only while its set is non-empty
type ConnectionMap = HashMap<UserId, HashMap<SessionId, Session>>;

/// Commands sent from connections to the registry control loop
#[derive(Debug)]
pub enum RegistryCommand {
    /// Socket accepted and bound to a user
    Register { session: Session },
    /// Socket closed
    Unregister {
        session_id: SessionId,
        user_id: UserId,
    },
    /// Decoded frame from a live session
    Inbound {
        session: SessionRef,
        frame: ClientFrame,
    },
}

/// Cloneable handle to the registry
///
/// Commands are queued to the control loop; lookups and `send_to_user`
/// read the shared map directly.
#[derive(Clone)]
pub struct RegistryHandle {
    commands: mpsc::Sender<RegistryCommand>,
    connections: Arc<RwLock<ConnectionMap>>,
}

impl RegistryHandle {
    pub async fn register(&self, session: Session) -> Result<(), AppError> {
        self.command(RegistryCommand::Register { session }).await
    }

    pub async fn unregister(&self, session_id: SessionId, user_id: UserId) -> Result<(), AppError> {
        self.command(RegistryCommand::Unregister {
            session_id,
            user_id,
        })
        .await
    }

    /// Admit an inbound frame for routing
    pub async fn admit(&self, session: SessionRef, frame: ClientFrame) -> Result<(), AppError> {
        self.command(RegistryCommand::Inbound { session, frame })
            .await
    }

    async fn command(&self, cmd: RegistryCommand) -> Result<(), AppError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| AppError::ChannelSend)
    }

    /// Enqueue `frame` on every session of `user_id` without blocking
    ///
    /// Sessions with a full queue miss this frame; an offline user is a
    /// silent no-op. Returns the number of sessions that accepted it.
    pub fn send_to_user(&self, user_id: UserId, frame: Outbound) -> usize {
        let connections = self.connections.read();
        let Some(sessions) = connections.get(&user_id) else {
            return 0;
        };

        let mut delivered = 0;
        for session in sessions.values() {
            match session.try_enqueue(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(SendError::Full) => {
                    warn!(
                        "Outbound queue full for session {} (user {}), frame dropped",
                        session.id, user_id
                    );
                }
                Err(SendError::ChannelClosed) => {
                    debug!("Session {} already closing, frame dropped", session.id);
                }
            }
        }
        delivered
    }

    /// Whether the user has at least one live session on this process
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.connections.read().contains_key(&user_id)
    }

    pub fn session_count(&self, user_id: UserId) -> usize {
        self.connections
            .read()
            .get(&user_id)
            .map_or(0, HashMap::len)
    }

    /// Users with at least one live session on this process
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.connections.read().keys().copied().collect();
        users.sort_unstable();
        users
    }
}

impl LocalDelivery for RegistryHandle {
    fn send_to_user(&self, user_id: UserId, frame: Outbound) -> usize {
        RegistryHandle::send_to_user(self, user_id, frame)
    }
}

/// The registry control loop
pub struct ConnectionRegistry {
    /// Shared with every handle; written only here
    connections: Arc<RwLock<ConnectionMap>>,
    router: EventRouter,
    presence: PresenceTracker,
    /// Command receiver channel
    receiver: mpsc::Receiver<RegistryCommand>,
}

impl ConnectionRegistry {
    /// Create the registry and a handle to it
    pub fn new(
        capacity: usize,
        router: EventRouter,
        presence: PresenceTracker,
    ) -> (Self, RegistryHandle) {
        let (commands, receiver) = mpsc::channel(capacity);
        let connections = Arc::new(RwLock::new(HashMap::new()));
        let handle = RegistryHandle {
            commands,
            connections: connections.clone(),
        };
        let registry = Self {
            connections,
            router,
            presence,
            receiver,
        };
        (registry, handle)
    }

    /// Run the control loop until every handle is dropped
    pub async fn run(mut self) {
        info!("ConnectionRegistry started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
        }

        info!("ConnectionRegistry shutting down");
    }

    async fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register { session } => {
                self.handle_register(session).await;
            }
            RegistryCommand::Unregister {
                session_id,
                user_id,
            } => {
                self.handle_unregister(session_id, user_id).await;
            }
            RegistryCommand::Inbound { session, frame } => {
                self.handle_inbound(session, frame).await;
            }
        }
    }

    async fn handle_register(&mut self, session: Session) {
        let user_id = session.user_id;
        let session_id = session.id;

        let (first, count) = {
            let mut connections = self.connections.write();
            let sessions = connections.entry(user_id).or_default();
            let first = sessions.is_empty();
            sessions.insert(session_id, session);
            (first, sessions.len())
        };

        info!(
            "Session {} registered for user {} ({} live)",
            session_id, user_id, count
        );
        if first {
            self.presence
                .on_transition(user_id, PresenceTransition::Online)
                .await;
        }
    }

    async fn handle_unregister(&mut self, session_id: SessionId, user_id: UserId) {
        let (removed, last) = {
            let mut connections = self.connections.write();
            let Some(sessions) = connections.get_mut(&user_id) else {
                return;
            };
            let removed = sessions.remove(&session_id);
            let last = removed.is_some() && sessions.is_empty();
            if last {
                connections.remove(&user_id);
            }
            (removed, last)
        };

        let Some(session) = removed else {
            return;
        };
        let lifetime = session.connected_at.elapsed();
        // dropping the session closes its outbound queue
        drop(session);

        info!(
            "Session {} unregistered for user {} after {:?}",
            session_id, user_id, lifetime
        );
        if last {
            self.presence
                .on_transition(user_id, PresenceTransition::Offline)
                .await;
        }
    }

    async fn handle_inbound(&mut self, session: SessionRef, frame: ClientFrame) {
        if !session.is_open() {
            debug!("Dropping frame from closed session {}", session.id);
            return;
        }
        match self.router.dispatch(&session, frame).await {
            Ok(outcome) => debug!("Session {} frame handled: {:?}", session.id, outcome),
            Err(e) => warn!("Frame from user {} not delivered: {}", session.user_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;

    use super::*;
    use crate::broker::{Broker, MemoryBroker, Subscription};
    use crate::bus::FanoutBus;
    use crate::memory::InMemoryStore;
    use crate::store::{PresenceStatus, RoomKind, UserProfile};
    use crate::types::RoomId;

    struct Fixture {
        store: Arc<InMemoryStore>,
        handle: RegistryHandle,
        statuses: Subscription,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        store.add_user(UserProfile {
            id: UserId(1),
            username: "alice".to_string(),
            avatar: String::new(),
            status: PresenceStatus::Offline,
        });
        store.add_room(RoomId(5), "", RoomKind::Private, UserId(1), &[UserId(1), UserId(2)]);
        let broker = Arc::new(MemoryBroker::new());
        let statuses = broker.psubscribe(&["user-status:*"]).await.unwrap();
        let bus = FanoutBus::new(broker, store.clone());
        let router = EventRouter::new(store.clone(), store.clone(), bus.clone());
        let presence = PresenceTracker::new(store.clone(), bus);
        let (registry, handle) = ConnectionRegistry::new(16, router, presence);
        tokio::spawn(registry.run());
        Fixture {
            store,
            handle,
            statuses,
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn drain_statuses(sub: &mut Subscription) -> Vec<String> {
        let mut statuses = Vec::new();
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(100), sub.recv()).await {
            let wire: Value = serde_json::from_str(&msg.payload).unwrap();
            statuses.push(wire["payload"]["data"]["status"].as_str().unwrap().to_string());
        }
        statuses
    }

    #[tokio::test]
    async fn test_presence_events_only_on_crossings() {
        let mut fx = fixture().await;
        let user = UserId(1);

        let (s1, _rx1) = Session::new(user, 8);
        let (s2, _rx2) = Session::new(user, 8);
        let (id1, id2) = (s1.id, s2.id);
        fx.handle.register(s1).await.unwrap();
        fx.handle.register(s2).await.unwrap();
        fx.handle.unregister(id1, user).await.unwrap();
        fx.handle.unregister(id1, user).await.unwrap(); // duplicate is a no-op
        fx.handle.unregister(id2, user).await.unwrap();

        let (s3, _rx3) = Session::new(user, 8);
        let id3 = s3.id;
        fx.handle.register(s3).await.unwrap();
        wait_until(|| fx.handle.is_online(user)).await;
        fx.handle.unregister(id3, user).await.unwrap();
        wait_until(|| !fx.handle.is_online(user)).await;

        // 7 calls, 4 crossings
        assert_eq!(
            drain_statuses(&mut fx.statuses).await,
            vec!["online", "offline", "online", "offline"]
        );
        assert_eq!(fx.store.status(user), Some(PresenceStatus::Offline));
    }

    #[tokio::test]
    async fn test_multiple_sessions_per_user() {
        let fx = fixture().await;
        let user = UserId(1);
        let (s1, mut rx1) = Session::new(user, 8);
        let (s2, mut rx2) = Session::new(user, 8);
        fx.handle.register(s1).await.unwrap();
        fx.handle.register(s2).await.unwrap();
        wait_until(|| fx.handle.session_count(user) == 2).await;
        assert_eq!(fx.handle.online_users(), vec![user]);

        assert_eq!(fx.handle.send_to_user(user, Arc::from("hello")), 2);
        assert_eq!(&*rx1.recv().await.unwrap(), "hello");
        assert_eq!(&*rx2.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_unknown_user_send_is_noop() {
        let fx = fixture().await;
        assert_eq!(fx.handle.send_to_user(UserId(99), Arc::from("x")), 0);
    }

    #[tokio::test]
    async fn test_unregister_closes_outbound_queue() {
        let fx = fixture().await;
        let (session, mut rx) = Session::new(UserId(1), 8);
        let id = session.id;
        fx.handle.register(session).await.unwrap();
        wait_until(|| fx.handle.is_online(UserId(1))).await;

        fx.handle.send_to_user(UserId(1), Arc::from("last"));
        fx.handle.unregister(id, UserId(1)).await.unwrap();

        // queued frame drains before the close is observed
        assert_eq!(&*rx.recv().await.unwrap(), "last");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let fx = fixture().await;
        const K: usize = 4;
        let (session, mut rx) = Session::new(UserId(2), K);
        fx.handle.register(session).await.unwrap();
        wait_until(|| fx.handle.is_online(UserId(2))).await;

        // nobody drains `rx`: the session is stalled
        let mut accepted = 0;
        for i in 0..=K {
            accepted += fx.handle.send_to_user(UserId(2), Arc::from(i.to_string()));
        }
        assert_eq!(accepted, K);

        let mut queued = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            queued.push(frame.to_string());
        }
        assert_eq!(queued, vec!["0", "1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_inbound_ping_routed_to_same_session() {
        let fx = fixture().await;
        let (s1, mut rx1) = Session::new(UserId(2), 8);
        let (s2, mut rx2) = Session::new(UserId(2), 8);
        let h1 = s1.handle();
        fx.handle.register(s1).await.unwrap();
        fx.handle.register(s2).await.unwrap();
        wait_until(|| fx.handle.session_count(UserId(2)) == 2).await;

        fx.handle.admit(h1, ClientFrame::Ping).await.unwrap();
        let pong = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let frame = rx1.recv().await.unwrap();
                if frame.contains("pong") {
                    return frame;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(&*pong, r#"{"type":"pong"}"#);
        while let Ok(frame) = rx2.try_recv() {
            assert!(!frame.contains("pong"));
        }
    }
}
