//! Gateway startup and wiring
//!
//! Builds one process's worth of the delivery core: the fan-out bus over a
//! shared broker, the event router, presence tracking, the registry control
//! loop and the bus delivery loop, then accepts sockets.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::broker::Broker;
use crate::bus::{Delivery, FanoutBus};
use crate::config::GatewayConfig;
use crate::connection::handle_connection;
use crate::error::AppError;
use crate::presence::PresenceTracker;
use crate::registry::{ConnectionRegistry, RegistryHandle};
use crate::router::EventRouter;
use crate::store::{FriendStore, MessageStore, RoomStore, UserStore};

/// Store collaborators used by the core
#[derive(Clone)]
pub struct Stores {
    pub messages: Arc<dyn MessageStore>,
    pub rooms: Arc<dyn RoomStore>,
    pub friends: Arc<dyn FriendStore>,
    pub users: Arc<dyn UserStore>,
}

impl Stores {
    /// Use one backend for every collaborator
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: MessageStore + RoomStore + FriendStore + UserStore + 'static,
    {
        Self {
            messages: store.clone(),
            rooms: store.clone(),
            friends: store.clone(),
            users: store,
        }
    }
}

/// One running gateway process
pub struct Gateway {
    registry: RegistryHandle,
    outbound_capacity: usize,
}

impl Gateway {
    /// Wire the core and start the registry and delivery loops
    ///
    /// Fails only if the initial broker subscription cannot be opened.
    pub async fn start(
        config: &GatewayConfig,
        stores: Stores,
        broker: Arc<dyn Broker>,
    ) -> Result<Self, AppError> {
        let bus = FanoutBus::new(broker, stores.friends);
        let router = EventRouter::new(stores.messages, stores.rooms.clone(), bus.clone());
        let presence = PresenceTracker::new(stores.users, bus.clone());
        let (registry, handle) = ConnectionRegistry::new(config.control_capacity, router, presence);

        let subscription = bus.subscribe().await?;
        tokio::spawn(registry.run());
        tokio::spawn(Delivery::new(stores.rooms, handle.clone()).run(bus, subscription));
        info!("Gateway core started");

        Ok(Self {
            registry: handle,
            outbound_capacity: config.outbound_capacity,
        })
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Connection accept loop
    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    let registry = self.registry.clone();
                    let capacity = self.outbound_capacity;

                    // Spawn handler task for each connection
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, registry, capacity).await {
                            error!("Connection handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
