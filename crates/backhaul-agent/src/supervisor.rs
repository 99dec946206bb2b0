//! Keeps the agent connected to the relay

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::reconnect::RetryTimer;
use crate::registry::AgentRegistry;
use crate::session::RelaySession;
use backhaul_proto::TunnelMessage;
use backhaul_transport::{Connection, TransportConnector};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Where the agent is in its connection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connecting,
    Identified,
    Relaying,
}

/// The tunnel agent - holds the relay connection and serves its clients
pub struct Agent {
    config: AgentConfig,
    relay_connector: Arc<dyn TransportConnector>,
    backend_connector: Arc<dyn TransportConnector>,
    registry: AgentRegistry,
    state: watch::Sender<AgentState>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        relay_connector: Arc<dyn TransportConnector>,
        backend_connector: Arc<dyn TransportConnector>,
    ) -> Self {
        let (state, _) = watch::channel(AgentState::Disconnected);
        Self {
            config,
            relay_connector,
            backend_connector,
            registry: AgentRegistry::new(),
            state,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: AgentState) {
        self.state.send_replace(state);
    }

    /// Connect, relay and reconnect forever
    pub async fn run(&self) {
        let mut retry = RetryTimer::new(self.config.retry_delay);

        loop {
            let attempt = retry.next_attempt();
            self.set_state(AgentState::Connecting);
            info!(attempt, relay = %self.config.relay_url, "Connecting to relay");

            match self.identify().await {
                Ok(connection) => {
                    retry.reset();
                    self.relay(connection).await;
                }
                Err(e) => error!(attempt, "{}", e),
            }

            self.registry.clear().await;
            self.set_state(AgentState::Disconnected);

            info!("Reconnecting in {:?}...", retry.delay());
            retry.wait().await;
        }
    }

    async fn identify(&self) -> Result<Connection, AgentError> {
        let connection = self
            .relay_connector
            .connect(&self.config.relay_url)
            .await
            .map_err(AgentError::RelayUnreachable)?;

        connection
            .sender
            .send_message(&TunnelMessage::Identify)
            .await?;

        self.set_state(AgentState::Identified);
        info!(relay = %self.config.relay_url, "✅ Connected to relay");
        Ok(connection)
    }

    async fn relay(&self, connection: Connection) {
        let (upstream, receiver) = connection.split();
        let session = RelaySession::new(
            upstream.clone(),
            self.registry.clone(),
            self.backend_connector.clone(),
            self.config.backend_url.clone(),
        );

        self.set_state(AgentState::Relaying);
        match session.run(receiver).await {
            Ok(()) => error!("❌ Relay closed the connection"),
            Err(e) => error!(error = %e, "❌ Relay connection lost"),
        }

        upstream.close().await;
        if self.registry.count() > 0 {
            warn!(
                active_connections = self.registry.count(),
                "Dropping backend connections of the lost relay session"
            );
        }
    }
}
