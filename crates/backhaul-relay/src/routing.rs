//! Routing table for peer connections and the agent slot
//!
//! Peers are keyed by the identifier the relay generated for them. The agent
//! is kept in a dedicated slot so that "at most one agent" holds by
//! construction: promoting a connection replaces whatever occupied the slot.

use backhaul_proto::PeerId;
use backhaul_transport::MessageSender;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Where a peer is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Connected while no agent was attached; never announced
    AwaitingAgent,
    /// Announced to the agent, waiting for its acknowledgement
    Handshaking,
    /// Acknowledged; traffic flows
    Established,
}

/// A live external connection
#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub id: PeerId,
    pub sender: MessageSender,
    pub state: PeerState,
    pub connected_at: Instant,
}

/// The connection currently acting as the agent
#[derive(Debug, Clone)]
pub struct AgentSlot {
    /// Identifier the connection was given before it identified
    pub connection_id: PeerId,
    pub sender: MessageSender,
    pub identified_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    peers: Arc<DashMap<PeerId, PeerConnection>>,
    agent: Arc<RwLock<Option<AgentSlot>>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection
    pub fn insert_peer(&self, id: PeerId, sender: MessageSender, state: PeerState) {
        trace!(peer_id = %id, ?state, "Registering client");
        self.peers.insert(
            id.clone(),
            PeerConnection {
                id,
                sender,
                state,
                connected_at: Instant::now(),
            },
        );
    }

    /// Remove a peer.
    ///
    /// Returns the entry the first time and `None` afterwards, so double
    /// removal is a no-op.
    pub fn remove_peer(&self, id: &PeerId) -> Option<PeerConnection> {
        let removed = self.peers.remove(id).map(|(_, peer)| peer);
        if let Some(peer) = &removed {
            debug!(
                peer_id = %id,
                connected_secs = peer.connected_at.elapsed().as_secs(),
                remaining = self.peers.len(),
                "Client removed from routing table"
            );
        }
        removed
    }

    pub fn peer_sender(&self, id: &PeerId) -> Option<MessageSender> {
        self.peers.get(id).map(|entry| entry.sender.clone())
    }

    pub fn peer_state(&self, id: &PeerId) -> Option<PeerState> {
        self.peers.get(id).map(|entry| entry.state)
    }

    /// Update a peer's lifecycle state. Returns false if the peer is gone.
    pub fn set_state(&self, id: &PeerId, state: PeerState) -> bool {
        match self.peers.get_mut(id) {
            Some(mut entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    pub fn contains_peer(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Move a connection from the peer map into the agent slot.
    ///
    /// Returns the agent that was displaced, if any.
    pub async fn promote_to_agent(&self, id: &PeerId, sender: MessageSender) -> Option<AgentSlot> {
        self.peers.remove(id);

        let mut slot = self.agent.write().await;
        slot.replace(AgentSlot {
            connection_id: id.clone(),
            sender,
            identified_at: Instant::now(),
        })
    }

    pub async fn agent_sender(&self) -> Option<MessageSender> {
        self.agent.read().await.as_ref().map(|slot| slot.sender.clone())
    }

    pub async fn agent_id(&self) -> Option<PeerId> {
        self.agent
            .read()
            .await
            .as_ref()
            .map(|slot| slot.connection_id.clone())
    }

    pub async fn has_agent(&self) -> bool {
        self.agent.read().await.is_some()
    }

    /// Empty the agent slot if `id` still owns it, returning the cleared slot.
    ///
    /// A connection that was displaced by a later `identify` must not evict
    /// its successor when it closes.
    pub async fn clear_agent_if(&self, id: &PeerId) -> Option<AgentSlot> {
        let mut slot = self.agent.write().await;
        match slot.as_ref() {
            Some(current) if &current.connection_id == id => slot.take(),
            _ => None,
        }
    }
}
