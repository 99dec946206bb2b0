//! Transport abstraction layer for backhaul connections
//!
//! The relay and the agent only need an ordered, reliable, message-framed
//! pipe with a "closed" signal. This crate provides that pipe as a pair of
//! handles so that the relay and agent logic never couple to a specific wire
//! technology.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              backhaul-relay / backhaul-agent             │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ MessageSender / MessageReceiver
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            backhaul-transport (this crate)               │
//! │  - TransportListener    - TransportConnector             │
//! │  - Connection           - memory (in-process transport)  │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────────────────────┬──────────────────────────┐
//! │ backhaul-transport-websocket │  memory::MemoryNetwork   │
//! └──────────────────────────────┴──────────────────────────┘
//! ```
//!
//! A [`Connection`] is created together with a [`ConnectionIo`]. The
//! implementation drives the `ConnectionIo` side (typically with one writer
//! task and one reader task) while application code uses the cloneable
//! [`MessageSender`] and the single-owner [`MessageReceiver`].

pub mod memory;

use async_trait::async_trait;
use backhaul_proto::{codec, TunnelMessage};
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Depth of the per-connection outgoing and incoming queues
pub const CHANNEL_CAPACITY: usize = 256;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Failed to bind {address}: {reason}")]
    BindError { address: String, reason: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Work item for a connection's writer
#[derive(Debug)]
pub enum Outgoing {
    Text(String),
    Close,
}

/// Sending half of a connection.
///
/// Clones share the same underlying connection. Every `send` hands one whole
/// message to the connection's writer, so concurrent senders never interleave
/// partial writes.
#[derive(Debug, Clone)]
pub struct MessageSender {
    connection_id: Arc<str>,
    tx: mpsc::Sender<Outgoing>,
}

impl MessageSender {
    /// Queue a text message
    pub async fn send(&self, text: impl Into<String>) -> TransportResult<()> {
        self.tx
            .send(Outgoing::Text(text.into()))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Encode and queue a tunnel message
    pub async fn send_message(&self, message: &TunnelMessage) -> TransportResult<()> {
        let text =
            codec::encode(message).map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        self.send(text).await
    }

    /// Ask the writer to close the connection. Closing twice is harmless.
    ///
    /// Never waits on a full queue: the close request is then handed to a
    /// background task and delivered once the writer catches up.
    pub async fn close(&self) {
        match self.tx.try_send(Outgoing::Close) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(close)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(close).await;
                });
            }
        }
    }

    /// Whether the writer has stopped accepting messages
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Whether both handles write to the same connection
    pub fn same_connection(&self, other: &MessageSender) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Receiving half of a connection
#[derive(Debug)]
pub struct MessageReceiver {
    connection_id: Arc<str>,
    rx: mpsc::Receiver<TransportResult<String>>,
}

impl MessageReceiver {
    /// Receive the next text message.
    ///
    /// Returns `Ok(None)` once the connection has been closed cleanly and
    /// `Err` if it broke.
    pub async fn recv(&mut self) -> TransportResult<Option<String>> {
        match self.rx.recv().await {
            Some(Ok(text)) => Ok(Some(text)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

/// An established message connection
#[derive(Debug)]
pub struct Connection {
    pub sender: MessageSender,
    pub receiver: MessageReceiver,
}

/// The implementation side of a [`Connection`]
#[derive(Debug)]
pub struct ConnectionIo {
    /// Messages queued by the application, to be written out
    pub outgoing: mpsc::Receiver<Outgoing>,
    /// Messages read from the wire, to be handed to the application
    pub incoming: mpsc::Sender<TransportResult<String>>,
}

impl Connection {
    /// Create a connection and the I/O handles an implementation drives
    pub fn channel(connection_id: impl Into<String>) -> (Self, ConnectionIo) {
        let connection_id: Arc<str> = Arc::from(connection_id.into());
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let connection = Self {
            sender: MessageSender {
                connection_id: connection_id.clone(),
                tx: out_tx,
            },
            receiver: MessageReceiver {
                connection_id,
                rx: in_rx,
            },
        };

        let io = ConnectionIo {
            outgoing: out_rx,
            incoming: in_tx,
        };

        (connection, io)
    }

    pub fn connection_id(&self) -> &str {
        self.sender.connection_id()
    }

    pub fn split(self) -> (MessageSender, MessageReceiver) {
        (self.sender, self.receiver)
    }
}

/// Server-side: Listens for incoming transport connections
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    /// Accept an incoming connection
    ///
    /// Returns the connection and the remote address of the connecting peer.
    async fn accept(&self) -> TransportResult<(Connection, SocketAddr)>;

    /// Get the local address this listener is bound to
    fn local_addr(&self) -> TransportResult<SocketAddr>;
}

/// Client-side: Establishes outgoing transport connections
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    /// Connect to a remote endpoint
    ///
    /// The meaning of `target` is transport specific (a URL for WebSocket, a
    /// listener name for the in-memory transport).
    async fn connect(&self, target: &str) -> TransportResult<Connection>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_proto::PeerId;

    #[tokio::test]
    async fn test_send_reaches_io_side() {
        let (connection, mut io) = Connection::channel("test-conn");
        let (sender, _receiver) = connection.split();

        sender.send("hello").await.unwrap();
        sender
            .send_message(&TunnelMessage::NewConnection {
                id: PeerId::from("A1"),
            })
            .await
            .unwrap();
        sender.close().await;

        match io.outgoing.recv().await {
            Some(Outgoing::Text(text)) => assert_eq!(text, "hello"),
            other => panic!("Expected text, got {:?}", other),
        }
        match io.outgoing.recv().await {
            Some(Outgoing::Text(text)) => {
                assert_eq!(text, r#"{"body":"new_connection","id":"A1"}"#)
            }
            other => panic!("Expected text, got {:?}", other),
        }
        assert!(matches!(io.outgoing.recv().await, Some(Outgoing::Close)));
    }

    #[tokio::test]
    async fn test_receiver_reports_clean_close_and_errors() {
        let (connection, io) = Connection::channel("test-conn");
        let (_sender, mut receiver) = connection.split();

        io.incoming.send(Ok("one".to_string())).await.unwrap();
        io.incoming
            .send(Err(TransportError::ConnectionError("reset".to_string())))
            .await
            .unwrap();
        drop(io);

        assert_eq!(receiver.recv().await.unwrap().as_deref(), Some("one"));
        assert!(receiver.recv().await.is_err());
        assert!(receiver.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_after_writer_gone_fails() {
        let (connection, io) = Connection::channel("test-conn");
        drop(io);

        assert!(connection.sender.is_closed());
        let err = connection.sender.send("late").await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_close_does_not_wait_on_full_queue() {
        let (connection, mut io) = Connection::channel("stalled");
        for n in 0..CHANNEL_CAPACITY {
            connection.sender.send(n.to_string()).await.unwrap();
        }

        // Nobody drains the queue yet
        tokio::time::timeout(std::time::Duration::from_secs(1), connection.sender.close())
            .await
            .expect("close blocked on a full queue");

        for _ in 0..CHANNEL_CAPACITY {
            assert!(matches!(io.outgoing.recv().await, Some(Outgoing::Text(_))));
        }
        assert!(matches!(io.outgoing.recv().await, Some(Outgoing::Close)));
    }

    #[test]
    fn test_same_connection() {
        let (a, _a_io) = Connection::channel("a");
        let (b, _b_io) = Connection::channel("b");

        let a_clone = a.sender.clone();
        assert!(a.sender.same_connection(&a_clone));
        assert!(!a.sender.same_connection(&b.sender));
        assert_eq!(a.connection_id(), "a");
        assert_eq!(a.receiver.connection_id(), "a");
    }

    #[test]
    fn test_transport_errors() {
        let err = TransportError::ConnectionRefused("backend".to_string());
        assert!(err.to_string().contains("Connection refused"));

        let err = TransportError::BindError {
            address: "0.0.0.0:80".to_string(),
            reason: "in use".to_string(),
        };
        assert!(err.to_string().contains("0.0.0.0:80"));
    }
}
