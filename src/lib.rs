//! Multi-device WebSocket Delivery Core
//!
//! Real-time delivery for a chat service built with tokio-tungstenite,
//! using the Actor pattern for connection state and a shared pub/sub
//! broker for fan-out across processes.
//!
//! # Features
//! - Many simultaneous sessions per user
//! - Presence as "has at least one live session", announced to friends
//! - Chat messages persisted before broadcast
//! - Typing indicators and monotonic read watermarks
//! - Bounded per-session outbound queues that drop instead of blocking
//! - Cross-process delivery through `room:<id>` / `user-status:<id>` channels
//!
//! # Architecture
//! - `ConnectionRegistry` is the actor owning every live session; it is the
//!   only writer of the session map and serializes register, unregister and
//!   inbound events through one `mpsc` channel
//! - Each socket runs an inbound and an outbound pump
//! - `EventRouter` persists through the store traits, then publishes to the
//!   `FanoutBus`
//! - Every process runs one bus delivery loop that resolves recipients and
//!   calls `RegistryHandle::send_to_user`
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use chat_gateway::{Gateway, GatewayConfig, InMemoryStore, MemoryBroker, Stores};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::default();
//!     let stores = Stores::shared(Arc::new(InMemoryStore::new()));
//!     let gateway = Gateway::start(&config, stores, Arc::new(MemoryBroker::new())).await?;
//!
//!     let listener = TcpListener::bind(&config.addr).await?;
//!     gateway.serve(listener).await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod bus;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod presence;
pub mod registry;
pub mod router;
pub mod session;
pub mod startup;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use broker::{Broker, BrokerMessage, MemoryBroker};
pub use bus::{Delivery, FanoutBus, FanoutScope, LocalDelivery};
pub use config::GatewayConfig;
pub use connection::handle_connection;
pub use envelope::{decode_frame, BusEnvelope, ClientFrame, EnvelopeKind, ServerEnvelope};
pub use error::{AppError, BrokerError, ConfigError, SendError, StoreError};
pub use memory::InMemoryStore;
pub use presence::{PresenceTracker, PresenceTransition};
pub use registry::{ConnectionRegistry, RegistryCommand, RegistryHandle};
pub use router::{DispatchOutcome, EventRouter};
pub use session::{Session, SessionRef};
pub use startup::{Gateway, Stores};
pub use types::{MessageId, RoomId, SessionId, UserId};

#[cfg(feature = "redis")]
pub use broker::RedisBroker;
