//! Relay accept loop

use crate::handler::handle_connection;
use crate::pending::PendingAcknowledgements;
use crate::routing::RoutingTable;
use backhaul_transport::TransportListener;
use std::time::Duration;
use tracing::{error, info};

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Shared state of one relay instance.
///
/// Clones are handles to the same routing table and pending set.
#[derive(Debug, Clone, Default)]
pub struct RelayState {
    pub routing: RoutingTable,
    pub pending: PendingAcknowledgements,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Relay server
pub struct RelayServer<L> {
    listener: L,
    state: RelayState,
}

impl<L: TransportListener> RelayServer<L> {
    pub fn new(listener: L) -> Self {
        Self {
            listener,
            state: RelayState::new(),
        }
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    /// Accept connections forever, one task per connection
    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Relay accepting connections on {}", addr),
            Err(_) => info!("Relay accepting connections"),
        }

        loop {
            match self.listener.accept().await {
                Ok((connection, remote_addr)) => {
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        handle_connection(state, connection, remote_addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                }
            }
        }
    }
}
