//! Message loop for one identified relay connection

use crate::error::AgentError;
use crate::registry::AgentRegistry;
use crate::spoofed::{run_backend, SpoofedConnection};
use backhaul_proto::{codec, PeerId, TunnelMessage};
use backhaul_transport::{MessageReceiver, MessageSender, TransportConnector};
use std::sync::Arc;
use tracing::{debug, warn};

/// Interprets relay messages for the lifetime of one relay connection
pub struct RelaySession {
    upstream: MessageSender,
    registry: AgentRegistry,
    backend_connector: Arc<dyn TransportConnector>,
    backend_url: String,
}

impl RelaySession {
    pub fn new(
        upstream: MessageSender,
        registry: AgentRegistry,
        backend_connector: Arc<dyn TransportConnector>,
        backend_url: impl Into<String>,
    ) -> Self {
        Self {
            upstream,
            registry,
            backend_connector,
            backend_url: backend_url.into(),
        }
    }

    /// Process relay messages until the relay connection ends.
    ///
    /// Returns `Ok(())` on a clean close and the transport error otherwise.
    pub async fn run(&self, mut receiver: MessageReceiver) -> Result<(), AgentError> {
        loop {
            let text = match receiver.recv().await? {
                Some(text) => text,
                None => return Ok(()),
            };

            if let Err(e) = self.dispatch(&text).await {
                match e {
                    AgentError::UninitializedPeer(_) => warn!("Dropping data: {}", e),
                    other => warn!(error = %other, "Dropping relay message"),
                }
            }
        }
    }

    async fn dispatch(&self, text: &str) -> Result<(), AgentError> {
        match codec::decode(text)? {
            TunnelMessage::NewConnection { id } => {
                self.open(id).await;
                Ok(())
            }
            TunnelMessage::DelConnection { id } => {
                if !self.registry.remove(&id).await {
                    debug!(peer_id = %id, "del_connection for unknown client");
                }
                Ok(())
            }
            TunnelMessage::Data { id, data } => self.registry.send_data(&id, &data).await,
            other => {
                debug!(peer_id = ?other.peer_id(), "Ignoring {} message from relay", other.kind());
                Ok(())
            }
        }
    }

    /// Register `id` and dial its backend without blocking the loop
    async fn open(&self, id: PeerId) {
        let spoofed = SpoofedConnection::new(id.clone(), self.upstream.clone());
        if let Some(previous) = self.registry.insert(spoofed.clone()) {
            warn!(peer_id = %id, "Relay reused a client id, replacing connection");
            previous.close().await;
        }

        tokio::spawn(run_backend(
            spoofed,
            self.registry.clone(),
            self.backend_connector.clone(),
            self.backend_url.clone(),
        ));
    }
}
