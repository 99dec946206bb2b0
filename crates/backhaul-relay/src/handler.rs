//! Per-connection handler
//!
//! Every accepted connection starts out as a peer. It may later declare
//! itself the agent with `identify`, after which payload it sends is no
//! longer forwarded and its closure empties the agent slot instead of
//! producing a `del_connection` notice.

use crate::error::RelayError;
use crate::routing::PeerState;
use crate::server::RelayState;
use backhaul_proto::codec::{self, CodecError};
use backhaul_proto::{MessageKind, PeerId, TunnelMessage};
use backhaul_transport::{Connection, MessageReceiver, MessageSender};
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

/// Serve one accepted connection until it closes
pub async fn handle_connection(state: RelayState, connection: Connection, remote_addr: SocketAddr) {
    let (sender, receiver) = connection.split();
    let id = PeerId::generate();
    info!(peer_id = %id, remote = %remote_addr, "New connection");

    let mut handler = ConnectionHandler::new(state, id, sender, receiver);
    handler.run().await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Peer,
    Agent,
}

/// Frames the relay acts on itself; everything else is peer payload
#[derive(Debug, Deserialize)]
#[serde(tag = "body", rename_all = "snake_case")]
enum Control {
    Identify,
    Return { id: PeerId, data: Value },
    AcknowledgeNewConnection { id: PeerId },
}

#[derive(Debug)]
enum Inbound {
    Control(Control),
    Payload(Value),
}

impl Inbound {
    fn classify(value: Value) -> Result<Self, CodecError> {
        match MessageKind::of(&value) {
            Some(
                kind @ (MessageKind::Identify
                | MessageKind::Return
                | MessageKind::AcknowledgeNewConnection),
            ) => serde_json::from_value(value)
                .map(Inbound::Control)
                .map_err(|source| CodecError::Malformed { kind, source }),
            _ => Ok(Inbound::Payload(value)),
        }
    }
}

fn is_identify(text: &str) -> bool {
    codec::parse(text)
        .ok()
        .and_then(|value| MessageKind::of(&value))
        == Some(MessageKind::Identify)
}

/// How the wait for the agent's acknowledgement ended
#[derive(Debug, PartialEq, Eq)]
enum Handshake {
    Completed,
    /// The connection turned out to be an agent, or the wait was cut short
    Skipped,
    Disconnected,
}

struct ConnectionHandler {
    state: RelayState,
    id: PeerId,
    sender: MessageSender,
    receiver: MessageReceiver,
    role: Role,
    /// Frames received while the handshake was outstanding
    backlog: VecDeque<String>,
}

impl ConnectionHandler {
    fn new(state: RelayState, id: PeerId, sender: MessageSender, receiver: MessageReceiver) -> Self {
        Self {
            state,
            id,
            sender,
            receiver,
            role: Role::Peer,
            backlog: VecDeque::new(),
        }
    }

    async fn run(&mut self) {
        if self.handshake().await != Handshake::Disconnected {
            self.message_loop().await;
        }
        self.teardown().await;
    }

    /// Register the connection and, when an agent is attached, announce it
    /// and hold its traffic until the agent acknowledges.
    async fn handshake(&mut self) -> Handshake {
        let routing = &self.state.routing;

        let Some(agent) = routing.agent_sender().await else {
            routing.insert_peer(self.id.clone(), self.sender.clone(), PeerState::AwaitingAgent);
            warn!(peer_id = %self.id, "{}, client will not be forwarded", RelayError::NoAgentConnected);
            return Handshake::Skipped;
        };

        routing.insert_peer(self.id.clone(), self.sender.clone(), PeerState::Handshaking);

        // Registered before the notice goes out so an early ack is never lost
        let ack = self.state.pending.register(self.id.clone());
        let notice = TunnelMessage::NewConnection { id: self.id.clone() };
        if let Err(e) = agent.send_message(&notice).await {
            self.state.pending.abandon(&self.id);
            routing.set_state(&self.id, PeerState::AwaitingAgent);
            warn!(peer_id = %self.id, error = %e, "{}, agent went away", RelayError::NoAgentConnected);
            return Handshake::Skipped;
        }

        debug!(peer_id = %self.id, "Sent new_connection to agent");
        let outcome = self.await_acknowledgement(ack).await;
        if outcome == Handshake::Completed {
            self.state.routing.set_state(&self.id, PeerState::Established);
            debug!(peer_id = %self.id, buffered = self.backlog.len(), "Handshake complete");
        }
        outcome
    }

    /// Wait for the acknowledgement without a timeout while watching the
    /// connection itself for closure.
    async fn await_acknowledgement(&mut self, mut ack: oneshot::Receiver<()>) -> Handshake {
        loop {
            tokio::select! {
                biased;

                result = &mut ack => {
                    return match result {
                        Ok(()) => Handshake::Completed,
                        // Abandoned elsewhere; nothing left to wait for
                        Err(_) => Handshake::Skipped,
                    };
                }
                frame = self.receiver.recv() => match frame {
                    Ok(Some(text)) => {
                        // An agent connecting while an older agent holds the
                        // slot must not be stuck behind that agent's ack
                        if self.backlog.is_empty() && is_identify(&text) {
                            self.state.pending.abandon(&self.id);
                            self.backlog.push_back(text);
                            return Handshake::Skipped;
                        }
                        trace!(peer_id = %self.id, "Buffering frame until acknowledged");
                        self.backlog.push_back(text);
                    }
                    Ok(None) => {
                        debug!(peer_id = %self.id, "Client closed during handshake");
                        return Handshake::Disconnected;
                    }
                    Err(e) => {
                        debug!(peer_id = %self.id, error = %e, "Client failed during handshake");
                        return Handshake::Disconnected;
                    }
                }
            }
        }
    }

    async fn message_loop(&mut self) {
        while let Some(text) = self.backlog.pop_front() {
            self.process(&text).await;
        }

        loop {
            match self.receiver.recv().await {
                Ok(Some(text)) => self.process(&text).await,
                Ok(None) => {
                    debug!(connection_id = %self.id, "Connection closed");
                    break;
                }
                Err(e) => {
                    debug!(connection_id = %self.id, error = %e, "Connection error");
                    break;
                }
            }
        }
    }

    async fn process(&mut self, text: &str) {
        if let Err(e) = self.dispatch(text).await {
            warn!(connection_id = %self.id, error = %e, "Dropping message");
        }
    }

    async fn dispatch(&mut self, text: &str) -> Result<(), RelayError> {
        let value = codec::parse(text)?;

        match Inbound::classify(value)? {
            Inbound::Control(Control::Identify) => self.become_agent().await,
            Inbound::Control(Control::Return { id, data }) => self.return_to_peer(id, data).await,
            Inbound::Control(Control::AcknowledgeNewConnection { id }) => {
                self.acknowledge(&id);
                Ok(())
            }
            Inbound::Payload(payload) => self.forward_to_agent(payload).await,
        }
    }

    async fn become_agent(&mut self) -> Result<(), RelayError> {
        if self.role == Role::Agent {
            debug!(connection_id = %self.id, "Agent identified again");
            return Ok(());
        }

        let routing = &self.state.routing;
        self.state.pending.abandon(&self.id);

        // The previous agent may already hold a spoofed connection for us
        let announced = matches!(
            routing.peer_state(&self.id),
            Some(PeerState::Handshaking | PeerState::Established)
        );
        if announced {
            if let Some(agent) = routing.agent_sender().await {
                let _ = agent
                    .send_message(&TunnelMessage::DelConnection { id: self.id.clone() })
                    .await;
            }
        }

        if let Some(previous) = routing.promote_to_agent(&self.id, self.sender.clone()).await {
            warn!(
                previous = %previous.connection_id,
                connection_id = %self.id,
                "Replacing the attached agent"
            );
        }

        self.role = Role::Agent;
        info!(connection_id = %self.id, "✅ Agent connected");
        Ok(())
    }

    async fn return_to_peer(&self, id: PeerId, data: Value) -> Result<(), RelayError> {
        let peer = self
            .state
            .routing
            .peer_sender(&id)
            .ok_or_else(|| RelayError::UnknownPeer(id.clone()))?;

        peer.send(codec::render_payload(&data)).await?;
        trace!(peer_id = %id, "Returned payload to client");
        Ok(())
    }

    fn acknowledge(&self, id: &PeerId) {
        if self.state.pending.acknowledge(id) {
            debug!(peer_id = %id, "Client acknowledged by agent");
        } else {
            warn!(peer_id = %id, "Acknowledgement for a client that is not pending");
        }
    }

    async fn forward_to_agent(&self, payload: Value) -> Result<(), RelayError> {
        if self.role == Role::Agent {
            warn!(connection_id = %self.id, "Agent sent untagged payload, dropping");
            return Ok(());
        }

        let agent = self
            .state
            .routing
            .agent_sender()
            .await
            .ok_or(RelayError::NoAgentConnected)?;

        agent
            .send_message(&TunnelMessage::Data {
                id: self.id.clone(),
                data: payload,
            })
            .await?;
        trace!(peer_id = %self.id, "Forwarded payload to agent");
        Ok(())
    }

    async fn teardown(&mut self) {
        let routing = &self.state.routing;

        match self.role {
            Role::Agent => {
                if let Some(slot) = routing.clear_agent_if(&self.id).await {
                    error!(
                        connection_id = %self.id,
                        duration_secs = slot.identified_at.elapsed().as_secs(),
                        "❌ Agent disconnected"
                    );
                } else {
                    info!(connection_id = %self.id, "Replaced agent connection closed");
                }
            }
            Role::Peer => {
                self.state.pending.abandon(&self.id);

                if routing.remove_peer(&self.id).is_some() {
                    match routing.agent_sender().await {
                        Some(agent) => {
                            let notice = TunnelMessage::DelConnection { id: self.id.clone() };
                            if let Err(e) = agent.send_message(&notice).await {
                                debug!(peer_id = %self.id, error = %e, "Could not send del_connection");
                            }
                        }
                        None => debug!(peer_id = %self.id, "No agent to notify of closure"),
                    }
                }
                info!(peer_id = %self.id, "Client disconnected");
            }
        }

        self.sender.close().await;
    }
}
