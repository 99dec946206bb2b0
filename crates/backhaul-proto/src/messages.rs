//! Protocol message types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier the relay assigns to each peer connection.
///
/// The relay generates UUID v4 strings, but the agent treats the value as an
/// opaque token and copies it verbatim into every message about that peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Main tunnel protocol message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "body", rename_all = "snake_case")]
pub enum TunnelMessage {
    /// Agent declares its connection as the agent
    Identify,
    /// A peer connected to the relay; the agent should dial the backend
    NewConnection { id: PeerId },
    /// A peer left; the agent drops its backend connection
    DelConnection { id: PeerId },
    /// The backend connection for `id` is up; the relay may release the peer
    AcknowledgeNewConnection { id: PeerId },
    /// Peer payload travelling towards the backend
    Data { id: PeerId, data: Value },
    /// Backend payload travelling back to the peer
    Return { id: PeerId, data: Value },
}

impl TunnelMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            TunnelMessage::Identify => MessageKind::Identify,
            TunnelMessage::NewConnection { .. } => MessageKind::NewConnection,
            TunnelMessage::DelConnection { .. } => MessageKind::DelConnection,
            TunnelMessage::AcknowledgeNewConnection { .. } => {
                MessageKind::AcknowledgeNewConnection
            }
            TunnelMessage::Data { .. } => MessageKind::Data,
            TunnelMessage::Return { .. } => MessageKind::Return,
        }
    }

    /// Peer this message concerns, if any
    pub fn peer_id(&self) -> Option<&PeerId> {
        match self {
            TunnelMessage::Identify => None,
            TunnelMessage::NewConnection { id }
            | TunnelMessage::DelConnection { id }
            | TunnelMessage::AcknowledgeNewConnection { id }
            | TunnelMessage::Data { id, .. }
            | TunnelMessage::Return { id, .. } => Some(id),
        }
    }
}

/// The recognised values of the `body` discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Identify,
    NewConnection,
    DelConnection,
    AcknowledgeNewConnection,
    Data,
    Return,
}

impl MessageKind {
    pub const ALL: [MessageKind; 6] = [
        MessageKind::Identify,
        MessageKind::NewConnection,
        MessageKind::DelConnection,
        MessageKind::AcknowledgeNewConnection,
        MessageKind::Data,
        MessageKind::Return,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Identify => "identify",
            MessageKind::NewConnection => "new_connection",
            MessageKind::DelConnection => "del_connection",
            MessageKind::AcknowledgeNewConnection => "acknowledge_new_connection",
            MessageKind::Data => "data",
            MessageKind::Return => "return",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }

    /// Kind of a parsed frame, if it is an object carrying a known `body` tag.
    ///
    /// Returns `None` for objects without `body`, for unknown tags and for
    /// non-object JSON values.
    pub fn of(value: &Value) -> Option<Self> {
        value
            .as_object()
            .and_then(|object| object.get("body"))
            .and_then(Value::as_str)
            .and_then(Self::from_tag)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
