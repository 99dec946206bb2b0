use backhaul_proto::{CodecError, PeerId};
use backhaul_transport::TransportError;
use thiserror::Error;

/// Errors raised while relaying a single message.
///
/// None of these end a connection; the handler logs them and drops the
/// offending message.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("No agent connected")]
    NoAgentConnected,

    #[error("Unknown client {0}")]
    UnknownPeer(PeerId),

    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
