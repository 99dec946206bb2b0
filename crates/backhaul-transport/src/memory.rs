//! In-process transport
//!
//! Connections are plain channel pairs pumped by two small tasks. Named
//! listeners live in a [`MemoryNetwork`], which lets tests run a relay, an
//! agent and a backend inside one runtime without touching sockets.

use crate::{
    Connection, ConnectionIo, Outgoing, TransportConnector, TransportError, TransportListener,
    TransportResult, CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

static NEXT_PAIR: AtomicU16 = AtomicU16::new(1);

/// Create two directly connected connections.
///
/// Whatever one side sends the other receives. Closing either side, or
/// dropping every sender of either side, closes both directions.
///
/// Must be called from within a Tokio runtime.
pub fn pair() -> (Connection, Connection) {
    let n = NEXT_PAIR.fetch_add(1, Ordering::Relaxed);
    let (left, left_io) = Connection::channel(format!("mem-{}-a", n));
    let (right, right_io) = Connection::channel(format!("mem-{}-b", n));

    let token = CancellationToken::new();
    let ConnectionIo {
        outgoing: left_out,
        incoming: left_in,
    } = left_io;
    let ConnectionIo {
        outgoing: right_out,
        incoming: right_in,
    } = right_io;

    tokio::spawn(pump(left_out, right_in, token.clone()));
    tokio::spawn(pump(right_out, left_in, token));

    (left, right)
}

async fn pump(
    mut outgoing: mpsc::Receiver<Outgoing>,
    incoming: mpsc::Sender<TransportResult<String>>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = outgoing.recv() => match next {
                Some(Outgoing::Text(text)) => {
                    // A dropped receiver just discards, like an unread socket
                    if incoming.send(Ok(text)).await.is_err() {
                        trace!("Memory connection receiver dropped, discarding message");
                    }
                }
                Some(Outgoing::Close) | None => {
                    token.cancel();
                    break;
                }
            }
        }
    }
}

/// A registry of named in-memory listeners
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<String, mpsc::Sender<Connection>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening under `name`, replacing any previous listener
    pub fn listen(&self, name: impl Into<String>) -> MemoryListener {
        let name = name.into();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.listeners.insert(name.clone(), tx.clone());
        debug!("Memory listener registered: {}", name);

        MemoryListener {
            name,
            tx,
            rx: Mutex::new(rx),
            network: self.clone(),
            accepted: AtomicU16::new(0),
        }
    }

    /// Whether something is listening under `name`
    pub fn is_listening(&self, name: &str) -> bool {
        self.listeners.contains_key(name)
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
        }
    }
}

/// Accepts connections dialed to one name
#[derive(Debug)]
pub struct MemoryListener {
    name: String,
    tx: mpsc::Sender<Connection>,
    rx: Mutex<mpsc::Receiver<Connection>>,
    network: MemoryNetwork,
    accepted: AtomicU16,
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        // Only unregister if a newer listener has not taken the name over
        self.network
            .listeners
            .remove_if(&self.name, |_, tx| tx.same_channel(&self.tx));
    }
}

#[async_trait]
impl TransportListener for MemoryListener {
    async fn accept(&self) -> TransportResult<(Connection, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(connection) => {
                let port = self.accepted.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
                Ok((connection, SocketAddr::from((Ipv4Addr::LOCALHOST, port))))
            }
            None => Err(TransportError::ConnectionError(format!(
                "Memory listener {} closed",
                self.name
            ))),
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
    }
}

/// Dials listeners of a [`MemoryNetwork`] by name
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self, target: &str) -> TransportResult<Connection> {
        let listener = self
            .network
            .listeners
            .get(target)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::ConnectionRefused(target.to_string()))?;

        let (local, remote) = pair();
        listener
            .send(remote)
            .await
            .map_err(|_| TransportError::ConnectionRefused(target.to_string()))?;

        debug!("Memory connection established to {}", target);
        Ok(local)
    }
}
