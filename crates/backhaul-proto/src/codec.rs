//! JSON codec for tunnel frames
//!
//! Frames are single JSON documents carried in one transport message, so there
//! is no length prefix or buffering here: one text message in, one value out.

use crate::messages::{MessageKind, TunnelMessage};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Malformed {kind} message: {source}")]
    Malformed {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown or missing message body")]
    UnknownBody,

    #[error("Encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Serialize a message into a text frame
pub fn encode(message: &TunnelMessage) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(CodecError::Encode)
}

/// Parse a text frame into an untyped JSON value
pub fn parse(text: &str) -> Result<Value, CodecError> {
    serde_json::from_str(text).map_err(CodecError::InvalidJson)
}

/// Strictly decode a text frame into a tunnel message
pub fn decode(text: &str) -> Result<TunnelMessage, CodecError> {
    TunnelMessage::from_value(parse(text)?)
}

impl TunnelMessage {
    /// Decode an already-parsed frame.
    ///
    /// The `body` tag must be one of the protocol tags and the fields required
    /// by that tag must be present.
    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let kind = MessageKind::of(&value).ok_or(CodecError::UnknownBody)?;
        serde_json::from_value(value).map_err(|source| CodecError::Malformed { kind, source })
    }
}

/// Render a payload as the text that goes out on a plain connection.
///
/// String payloads are sent as their raw contents so text produced by the
/// backend reaches the peer unchanged; any other value is serialized.
pub fn render_payload(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
