use backhaul_proto::{CodecError, PeerId};
use backhaul_transport::TransportError;
use thiserror::Error;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Client {0} is not initialized")]
    UninitializedPeer(PeerId),

    #[error("Backend unreachable: {0}")]
    BackendUnreachable(#[source] TransportError),

    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Relay unreachable: {0}")]
    RelayUnreachable(#[source] TransportError),
}
