//! Inbound event routing
//!
//! Turns decoded client frames into store writes followed by bus publishes.
//! A publish only ever follows a successful write, and always carries the
//! store-assigned identity.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bus::{FanoutBus, FanoutScope};
use crate::envelope::{ClientFrame, MessageData, ReadReceiptData, RoomCreatedData, ServerEnvelope};
use crate::error::AppError;
use crate::session::SessionRef;
use crate::store::{MessageStore, MessageType, NewMessage, RoomStore};
use crate::types::{MessageId, RoomId, UserId};

/// What a dispatch did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Answered on the sending session only
    Replied,
    /// Persisted message published to its room
    MessageSent(MessageId),
    /// Published without persistence
    Published,
    /// Nothing changed (e.g. a stale read receipt)
    Unchanged,
}

/// Dispatches client frames against the store collaborators
#[derive(Clone)]
pub struct EventRouter {
    messages: Arc<dyn MessageStore>,
    rooms: Arc<dyn RoomStore>,
    bus: FanoutBus,
}

impl EventRouter {
    pub fn new(messages: Arc<dyn MessageStore>, rooms: Arc<dyn RoomStore>, bus: FanoutBus) -> Self {
        Self {
            messages,
            rooms,
            bus,
        }
    }

    /// Dispatch one frame from `session`
    pub async fn dispatch(
        &self,
        session: &SessionRef,
        frame: ClientFrame,
    ) -> Result<DispatchOutcome, AppError> {
        let sender = session.user_id;
        match frame {
            ClientFrame::Ping => {
                session.reply(&ServerEnvelope::Pong)?;
                Ok(DispatchOutcome::Replied)
            }
            ClientFrame::Message {
                room_id,
                content,
                message_type,
                file_url,
                file_name,
                file_size,
                mentions,
            } => {
                let message = NewMessage {
                    room_id,
                    sender_id: sender,
                    content,
                    message_type: MessageType::parse(message_type.as_deref()),
                    file_url,
                    file_name,
                    file_size,
                    mentions,
                };
                let id = self.handle_message(message).await?;
                Ok(DispatchOutcome::MessageSent(id))
            }
            ClientFrame::Typing { room_id, data } => {
                self.handle_typing(sender, room_id, data).await;
                Ok(DispatchOutcome::Published)
            }
            ClientFrame::ReadReceipt {
                room_id,
                message_id,
            } => self.handle_read_receipt(sender, room_id, message_id).await,
        }
    }

    async fn handle_message(&self, message: NewMessage) -> Result<MessageId, AppError> {
        let room_id = message.room_id;
        let sender = message.sender_id;

        let members = self.rooms.get_members(room_id).await?;
        if !members.contains(&sender) {
            return Err(AppError::NotRoomMember {
                user: sender.0,
                room: room_id.0,
            });
        }

        let id = self.messages.create(message).await?;
        info!("User {} sent message {} to room {}", sender, id, room_id);

        self.unhide_room(room_id, &members).await;

        // re-read for store-side enrichment (sender profile, timestamps)
        let stored = self.messages.get_by_id(id).await?;
        let envelope = ServerEnvelope::Message {
            data: MessageData { message: stored },
        };
        self.bus.publish(FanoutScope::Room(room_id), &envelope).await;
        Ok(id)
    }

    /// Bring a soft-left room back into every member's list
    async fn unhide_room(&self, room_id: RoomId, members: &[UserId]) {
        for member in members {
            if let Err(e) = self.rooms.set_hidden(room_id, *member, false).await {
                warn!("Failed to unhide room {} for user {}: {}", room_id, member, e);
            }
        }

        match self.rooms.get_room(room_id).await {
            Ok(room) => {
                let envelope = ServerEnvelope::RoomCreated {
                    data: RoomCreatedData { room },
                };
                self.bus.publish(FanoutScope::Room(room_id), &envelope).await;
            }
            Err(e) => warn!("Failed to load room {} for refresh: {}", room_id, e),
        }
    }

    async fn handle_typing(&self, sender: UserId, room_id: RoomId, data: Value) {
        debug!("User {} typing in room {}", sender, room_id);
        let envelope = ServerEnvelope::Typing {
            room_id,
            user_id: sender,
            data,
        };
        self.bus.publish(FanoutScope::Room(room_id), &envelope).await;
    }

    async fn handle_read_receipt(
        &self,
        sender: UserId,
        room_id: RoomId,
        message_id: MessageId,
    ) -> Result<DispatchOutcome, AppError> {
        let update = self
            .messages
            .update_read_watermark(room_id, sender, message_id)
            .await?;
        if !update.advanced() {
            debug!(
                "Stale read receipt from {} in room {}: {} <= {}",
                sender,
                room_id,
                message_id,
                update.watermark().last_read_message_id
            );
            return Ok(DispatchOutcome::Unchanged);
        }

        let envelope = ServerEnvelope::ReadReceipt {
            data: ReadReceiptData {
                room_id,
                last_read_message_id: update.watermark().last_read_message_id,
                user_id: sender,
            },
        };
        self.bus.publish(FanoutScope::Room(room_id), &envelope).await;
        Ok(DispatchOutcome::Published)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::*;
    use crate::broker::{BrokerMessage, MemoryBroker, Subscription};
    use crate::bus::tests::RecordingDelivery;
    use crate::bus::Delivery;
    use crate::memory::InMemoryStore;
    use crate::session::Session;
    use crate::store::{PresenceStatus, RoomKind, UserProfile};

    struct Fixture {
        store: Arc<InMemoryStore>,
        router: EventRouter,
        subscription: Subscription,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        for (id, name) in [(1, "alice"), (2, "bob"), (4, "dave")] {
            store.add_user(UserProfile {
                id: UserId(id),
                username: name.to_string(),
                avatar: String::new(),
                status: PresenceStatus::Online,
            });
        }
        store.add_room(RoomId(5), "", RoomKind::Private, UserId(1), &[UserId(1), UserId(2)]);
        let bus = FanoutBus::new(Arc::new(MemoryBroker::new()), store.clone());
        let subscription = bus.subscribe().await.unwrap();
        let router = EventRouter::new(store.clone(), store.clone(), bus);
        Fixture {
            store,
            router,
            subscription,
        }
    }

    async fn next_published(sub: &mut Subscription) -> BrokerMessage {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("nothing published")
            .expect("subscription closed")
    }

    async fn assert_nothing_published(sub: &mut Subscription) {
        assert!(tokio::time::timeout(Duration::from_millis(50), sub.recv())
            .await
            .is_err());
    }

    fn text_message(room: u64, content: &str) -> ClientFrame {
        ClientFrame::Message {
            room_id: RoomId(room),
            content: content.to_string(),
            message_type: None,
            file_url: None,
            file_name: None,
            file_size: None,
            mentions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_message_round_trip() {
        let mut fx = fixture().await;
        fx.store.set_hidden(RoomId(5), UserId(1), true).await.unwrap();
        fx.store.set_hidden(RoomId(5), UserId(2), true).await.unwrap();
        let (session, _rx) = Session::new(UserId(1), 8);

        let outcome = fx
            .router
            .dispatch(&session.handle(), text_message(5, "hi"))
            .await
            .unwrap();
        let DispatchOutcome::MessageSent(id) = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };

        assert_eq!(fx.store.is_hidden(RoomId(5), UserId(1)), Some(false));
        assert_eq!(fx.store.is_hidden(RoomId(5), UserId(2)), Some(false));

        let refresh = next_published(&mut fx.subscription).await;
        let wire: Value = serde_json::from_str(&refresh.payload).unwrap();
        assert_eq!(wire["type"], "room_created");
        assert_eq!(wire["payload"]["data"]["room"]["id"], 5);

        let published = next_published(&mut fx.subscription).await;
        assert_eq!(published.channel, "room:5");

        let local = RecordingDelivery::default();
        let delivery = Delivery::new(fx.store.clone(), local.clone());
        delivery.deliver(published).await;
        assert_eq!(local.users(), vec![UserId(1), UserId(2)]);

        let frame: Value = serde_json::from_str(&local.calls.lock()[1].1).unwrap();
        assert_eq!(frame["type"], "message");
        let message = &frame["data"]["message"];
        assert_eq!(message["id"], id.0);
        assert_eq!(message["room_id"], 5);
        assert_eq!(message["content"], "hi");
        assert_eq!(message["sender"]["username"], "alice");
    }

    #[tokio::test]
    async fn test_non_member_message_rejected() {
        let mut fx = fixture().await;
        let (session, _rx) = Session::new(UserId(4), 8);

        let err = fx
            .router
            .dispatch(&session.handle(), text_message(5, "intrude"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotRoomMember { user: 4, room: 5 }));
        assert_eq!(fx.store.message_count(), 0);
        assert_nothing_published(&mut fx.subscription).await;
    }

    #[tokio::test]
    async fn test_persistence_failure_suppresses_broadcast() {
        let mut fx = fixture().await;
        let (session, _rx) = Session::new(UserId(1), 8);
        fx.store.set_unavailable(true);

        let err = fx
            .router
            .dispatch(&session.handle(), text_message(5, "lost"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Store(_)));
        assert_nothing_published(&mut fx.subscription).await;
    }

    #[tokio::test]
    async fn test_attachment_fields_carried() {
        let mut fx = fixture().await;
        let (session, _rx) = Session::new(UserId(1), 8);
        let frame = ClientFrame::Message {
            room_id: RoomId(5),
            content: String::new(),
            message_type: Some("file".to_string()),
            file_url: Some("/uploads/a.pdf".to_string()),
            file_name: Some("a.pdf".to_string()),
            file_size: Some(1024),
            mentions: vec![UserId(2)],
        };
        fx.router.dispatch(&session.handle(), frame).await.unwrap();

        let _refresh = next_published(&mut fx.subscription).await;
        let wire: Value = serde_json::from_str(&next_published(&mut fx.subscription).await.payload)
            .unwrap();
        let message = &wire["payload"]["data"]["message"];
        assert_eq!(message["type"], "file");
        assert_eq!(message["file_name"], "a.pdf");
        assert_eq!(message["file_size"], 1024);
        assert_eq!(message["mentions"], json!([2]));
    }

    #[tokio::test]
    async fn test_read_receipt_advances_and_publishes() {
        let mut fx = fixture().await;
        fx.store
            .update_read_watermark(RoomId(5), UserId(2), MessageId(30))
            .await
            .unwrap();
        let (session, _rx) = Session::new(UserId(2), 8);

        let frame = ClientFrame::ReadReceipt {
            room_id: RoomId(5),
            message_id: MessageId(42),
        };
        let outcome = fx.router.dispatch(&session.handle(), frame).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Published);
        assert_eq!(
            fx.store.watermark(RoomId(5), UserId(2)).unwrap().last_read_message_id,
            MessageId(42)
        );

        let wire: Value =
            serde_json::from_str(&next_published(&mut fx.subscription).await.payload).unwrap();
        assert_eq!(
            wire["payload"],
            json!({"type":"read_receipt","data":{"room_id":5,"last_read_message_id":42,"user_id":2}})
        );
    }

    #[tokio::test]
    async fn test_stale_read_receipt_is_noop() {
        let mut fx = fixture().await;
        let (session, _rx) = Session::new(UserId(2), 8);
        let handle = session.handle();

        let newer = ClientFrame::ReadReceipt {
            room_id: RoomId(5),
            message_id: MessageId(10),
        };
        fx.router.dispatch(&handle, newer).await.unwrap();
        let _ = next_published(&mut fx.subscription).await;

        let stale = ClientFrame::ReadReceipt {
            room_id: RoomId(5),
            message_id: MessageId(7),
        };
        let outcome = fx.router.dispatch(&handle, stale).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Unchanged);
        assert_eq!(
            fx.store.watermark(RoomId(5), UserId(2)).unwrap().last_read_message_id,
            MessageId(10)
        );
        assert_nothing_published(&mut fx.subscription).await;
    }

    #[tokio::test]
    async fn test_typing_published_with_sender() {
        let mut fx = fixture().await;
        let (session, _rx) = Session::new(UserId(1), 8);
        let frame = ClientFrame::Typing {
            room_id: RoomId(5),
            data: json!({"is_typing": true}),
        };
        fx.router.dispatch(&session.handle(), frame).await.unwrap();

        let wire: Value =
            serde_json::from_str(&next_published(&mut fx.subscription).await.payload).unwrap();
        assert_eq!(wire["type"], "typing");
        assert_eq!(wire["user_id"], 1);
        assert_eq!(wire["payload"]["data"]["is_typing"], true);
        assert_eq!(fx.store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_replies_on_session_only() {
        let mut fx = fixture().await;
        let (session, mut rx) = Session::new(UserId(1), 8);
        let outcome = fx
            .router
            .dispatch(&session.handle(), ClientFrame::Ping)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Replied);
        assert_eq!(&*rx.recv().await.unwrap(), r#"{"type":"pong"}"#);
        assert_nothing_published(&mut fx.subscription).await;
    }
}
