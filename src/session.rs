//! Session definition
//!
//! One accepted socket bound to one user identity and one bounded outbound
//! queue. The registry holds the only strong `Session`; everyone else sees a
//! `SessionRef`, so removing the session from the registry closes its queue.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{AppError, SendError};
use crate::envelope::ServerEnvelope;
use crate::types::{SessionId, UserId};

/// Serialized frame waiting in an outbound queue
///
/// Shared so one bus delivery can be enqueued on many sessions.
pub type Outbound = Arc<str>;

/// Live session owned by the registry
#[derive(Debug)]
pub struct Session {
    /// Unique identifier for this socket
    pub id: SessionId,
    /// Pre-validated owner of this socket
    pub user_id: UserId,
    /// Accept time
    pub connected_at: Instant,
    /// Gateway → socket queue
    sender: mpsc::Sender<Outbound>,
}

impl Session {
    /// Create a session with an outbound queue of `capacity` frames
    ///
    /// Returns the receiving half for the outbound pump.
    pub fn new(user_id: UserId, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let session = Self {
            id: SessionId::new(),
            user_id,
            connected_at: Instant::now(),
            sender,
        };
        (session, receiver)
    }

    /// Non-blocking enqueue
    ///
    /// A full queue drops `frame` (the newest) and leaves queued frames alone.
    pub fn try_enqueue(&self, frame: Outbound) -> Result<(), SendError> {
        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    /// Number of frames currently waiting
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Weak handle for the router and the inbound pump
    pub fn handle(&self) -> SessionRef {
        SessionRef {
            id: self.id,
            user_id: self.user_id,
            outbound: self.sender.downgrade(),
        }
    }
}

/// Non-owning view of a session
///
/// Does not keep the outbound queue open.
#[derive(Debug, Clone)]
pub struct SessionRef {
    pub id: SessionId,
    pub user_id: UserId,
    outbound: mpsc::WeakSender<Outbound>,
}

impl SessionRef {
    /// Enqueue a reply to this session only
    pub fn reply(&self, envelope: &ServerEnvelope) -> Result<(), AppError> {
        let sender = self.outbound.upgrade().ok_or(SendError::ChannelClosed)?;
        let frame: Outbound = Arc::from(envelope.to_text()?);
        sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })?;
        Ok(())
    }

    /// Whether the registry still holds this session
    pub fn is_open(&self) -> bool {
        self.outbound.upgrade().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_is_fifo() {
        let (session, mut rx) = Session::new(UserId(1), 4);
        session.try_enqueue(Arc::from("a")).unwrap();
        session.try_enqueue(Arc::from("b")).unwrap();
        assert_eq!(session.queued(), 2);
        assert_eq!(&*rx.recv().await.unwrap(), "a");
        assert_eq!(&*rx.recv().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let (session, mut rx) = Session::new(UserId(1), 2);
        session.try_enqueue(Arc::from("1")).unwrap();
        session.try_enqueue(Arc::from("2")).unwrap();
        assert_eq!(session.try_enqueue(Arc::from("3")), Err(SendError::Full));
        assert_eq!(session.queued(), 2);
        assert_eq!(&*rx.recv().await.unwrap(), "1");
        assert_eq!(&*rx.recv().await.unwrap(), "2");
    }

    #[tokio::test]
    async fn test_handle_does_not_keep_queue_open() {
        let (session, mut rx) = Session::new(UserId(1), 4);
        let handle = session.handle();
        handle.reply(&ServerEnvelope::Pong).unwrap();
        assert!(handle.is_open());

        drop(session);
        assert!(!handle.is_open());
        assert!(matches!(
            handle.reply(&ServerEnvelope::Pong),
            Err(AppError::Send(SendError::ChannelClosed))
        ));

        // queued frame drains, then the queue reports closed
        assert_eq!(&*rx.recv().await.unwrap(), r#"{"type":"pong"}"#);
        assert!(rx.recv().await.is_none());
    }
}
