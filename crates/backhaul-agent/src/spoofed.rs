//! Backend connections opened on behalf of relay clients

use crate::error::AgentError;
use crate::registry::AgentRegistry;
use backhaul_proto::{PeerId, TunnelMessage};
use backhaul_transport::{MessageReceiver, MessageSender, TransportConnector};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// The agent-side stand-in for one relay client.
///
/// Holds a handle to the shared relay connection and, once dialed, the
/// backend connection it owns.
#[derive(Debug, Clone)]
pub struct SpoofedConnection {
    id: PeerId,
    upstream: MessageSender,
    backend: Option<MessageSender>,
    created_at: Instant,
}

impl SpoofedConnection {
    pub fn new(id: PeerId, upstream: MessageSender) -> Self {
        Self {
            id,
            upstream,
            backend: None,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn backend(&self) -> Option<&MessageSender> {
        self.backend.as_ref()
    }

    /// Whether the backend connection is up
    pub fn is_established(&self) -> bool {
        self.backend.is_some()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn attach(&mut self, backend: MessageSender) {
        self.backend = Some(backend);
    }

    /// Close the owned backend connection, if any
    pub async fn close(&self) {
        if let Some(backend) = &self.backend {
            backend.close().await;
        }
    }
}

/// Dial the backend for a freshly registered `spoofed` connection,
/// acknowledge it upstream and pump backend output back as `return`
/// messages until either side goes away.
pub(crate) async fn run_backend(
    spoofed: SpoofedConnection,
    registry: AgentRegistry,
    connector: Arc<dyn TransportConnector>,
    backend_url: String,
) {
    let SpoofedConnection { id, upstream, .. } = spoofed;
    let connection = match connector.connect(&backend_url).await {
        Ok(connection) => connection,
        Err(e) => {
            // No acknowledgement: the relay keeps the client waiting
            warn!(peer_id = %id, "{}", AgentError::BackendUnreachable(e));
            registry.remove(&id).await;
            return;
        }
    };
    let (backend, receiver) = connection.split();

    if !registry.attach_backend(&id, backend.clone()) {
        debug!(peer_id = %id, "Client deleted while dialing backend");
        backend.close().await;
        return;
    }

    let ack = TunnelMessage::AcknowledgeNewConnection { id: id.clone() };
    if let Err(e) = upstream.send_message(&ack).await {
        warn!(peer_id = %id, error = %e, "Failed to acknowledge client");
        registry.detach(&id, &backend);
        backend.close().await;
        return;
    }
    info!(peer_id = %id, "Backend connected");

    if let Err(e) = pump_backend(&id, receiver, &upstream).await {
        warn!(peer_id = %id, error = %e, "Backend relay stopped");
    }

    registry.detach(&id, &backend);
    backend.close().await;
}

async fn pump_backend(
    id: &PeerId,
    mut receiver: MessageReceiver,
    upstream: &MessageSender,
) -> Result<(), AgentError> {
    loop {
        match receiver.recv().await {
            Ok(Some(text)) => {
                trace!(peer_id = %id, bytes = text.len(), "Backend -> relay");
                let message = TunnelMessage::Return {
                    id: id.clone(),
                    data: Value::String(text),
                };
                upstream.send_message(&message).await?;
            }
            Ok(None) => {
                info!(peer_id = %id, "Backend closed the connection");
                return Ok(());
            }
            Err(e) => {
                info!(peer_id = %id, error = %e, "Backend connection failed");
                return Ok(());
            }
        }
    }
}
