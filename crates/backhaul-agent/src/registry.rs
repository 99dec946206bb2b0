//! Registry of spoofed connections keyed by client identifier

use crate::error::AgentError;
use crate::spoofed::SpoofedConnection;
use backhaul_proto::PeerId;
use backhaul_transport::MessageSender;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Manages spoofed connections and their lifecycle
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    /// Map of client id -> SpoofedConnection
    connections: Arc<DashMap<PeerId, SpoofedConnection>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection whose backend is about to be dialed.
    ///
    /// Returns the entry that was replaced, if the relay reused an id.
    pub fn insert(&self, connection: SpoofedConnection) -> Option<SpoofedConnection> {
        let id = connection.id().clone();
        let previous = self.connections.insert(id.clone(), connection);

        debug!(
            peer_id = %id,
            active_connections = self.connections.len(),
            "Spoofed connection registered"
        );
        previous
    }

    /// Drop a connection and close its backend. Absent ids are ignored.
    pub async fn remove(&self, id: &PeerId) -> bool {
        let Some((_, connection)) = self.connections.remove(id) else {
            return false;
        };

        connection.close().await;
        info!(
            peer_id = %id,
            duration_secs = connection.age().as_secs(),
            active_connections = self.connections.len(),
            "Spoofed connection removed"
        );
        true
    }

    /// Store the dialed backend for `id`.
    ///
    /// Returns false if the id was removed while the dial was in flight.
    pub fn attach_backend(&self, id: &PeerId, backend: MessageSender) -> bool {
        match self.connections.get_mut(id) {
            Some(mut entry) => {
                entry.attach(backend);
                true
            }
            None => false,
        }
    }

    /// Forget `id` after its backend closed, unless the entry has since
    /// been replaced by one with a different backend.
    pub fn detach(&self, id: &PeerId, backend: &MessageSender) -> bool {
        let removed = self
            .connections
            .remove_if(id, |_, entry| {
                entry
                    .backend()
                    .map_or(false, |current| current.same_connection(backend))
            })
            .is_some();

        if removed {
            debug!(
                peer_id = %id,
                active_connections = self.connections.len(),
                "Spoofed connection detached"
            );
        }
        removed
    }

    /// Forward a client payload to the backend of `id`
    pub async fn send_data(&self, id: &PeerId, payload: &Value) -> Result<(), AgentError> {
        // Clone the sender out so no map guard is held across the send
        let backend = self
            .connections
            .get(id)
            .and_then(|entry| entry.backend().cloned())
            .ok_or_else(|| AgentError::UninitializedPeer(id.clone()))?;

        trace!(peer_id = %id, "Relay -> backend");
        backend.send(payload.to_string()).await?;
        Ok(())
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.connections.contains_key(id)
    }

    /// Whether `id` has a connected backend
    pub fn is_established(&self, id: &PeerId) -> bool {
        self.connections
            .get(id)
            .map_or(false, |entry| entry.is_established())
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Close every backend connection
    pub async fn clear(&self) {
        let ids: Vec<PeerId> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for id in ids {
            if let Some((_, connection)) = self.connections.remove(&id) {
                connection.close().await;
            }
        }
    }
}
