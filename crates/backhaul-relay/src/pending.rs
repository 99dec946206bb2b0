//! Pending handshake acknowledgements
//!
//! Tracks peers that were announced to the agent with `new_connection` and
//! releases each peer's handler when the agent's acknowledgement arrives.

use backhaul_proto::PeerId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Identifiers waiting for `acknowledge_new_connection`
#[derive(Debug, Clone, Default)]
pub struct PendingAcknowledgements {
    /// Maps peer id -> signal for the waiting handler
    waiters: Arc<DashMap<PeerId, oneshot::Sender<()>>>,
}

impl PendingAcknowledgements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer before announcing it.
    ///
    /// Returns a receiver that completes when the acknowledgement arrives.
    pub fn register(&self, id: PeerId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        debug!(peer_id = %id, "Awaiting acknowledgement");
        self.waiters.insert(id, tx);
        rx
    }

    /// Complete the handshake for `id`.
    ///
    /// Returns true if a waiting handler was released, false if the id was
    /// not pending (unknown, already acknowledged or abandoned).
    pub fn acknowledge(&self, id: &PeerId) -> bool {
        match self.waiters.remove(id) {
            Some((_, tx)) => {
                if tx.send(()).is_err() {
                    warn!(peer_id = %id, "Acknowledged client is no longer waiting");
                    return false;
                }
                true
            }
            None => false,
        }
    }

    /// Forget a pending id without releasing anyone
    pub fn abandon(&self, id: &PeerId) -> bool {
        let removed = self.waiters.remove(id).is_some();
        if removed {
            debug!(peer_id = %id, "Abandoned pending acknowledgement");
        }
        removed
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.waiters.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.waiters.len()
    }
}
