//! Error types for the gateway
//!
//! Defines application-level errors plus the narrower errors returned by
//! the store collaborators, the pub/sub broker and the outbound queues.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// None of these are fatal to the process: transport errors tear down one
/// session, persistence errors suppress one broadcast.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal for the session)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Store collaborator failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Broker failure
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Configuration error (startup only)
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Outbound enqueue failed
    #[error("Send error: {0}")]
    Send(#[from] SendError),

    /// Channel send error (registry control loop has stopped)
    #[error("Channel send error")]
    ChannelSend,

    /// Sender is not a member of the target room
    #[error("User {user} is not a member of room {room}")]
    NotRoomMember { user: u64, room: u64 },
}

/// Errors returned by the message, room, friend and user stores
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Requested record does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Backing store cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by a pub/sub broker
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Broker cannot be reached
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Redis client error
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Outbound enqueue errors
///
/// Occurs when a non-blocking enqueue onto a session's outbound queue fails.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SendError {
    /// The queue is at capacity; the envelope was dropped
    #[error("Outbound queue full")]
    Full,

    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Seed file could not be read
    #[error("cannot read seed file {path}: {source}")]
    Seed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
