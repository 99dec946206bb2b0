//! WebSocket listener and connector implementations

use async_trait::async_trait;
use backhaul_transport::{
    Connection, TransportConnector, TransportError, TransportListener, TransportResult,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ensure_crypto_provider, WebSocketConfig};
use crate::connection::spawn_connection;

/// Pause after a failed TCP accept so a persistent error cannot spin
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

type Accepted = TransportResult<(Connection, SocketAddr)>;

/// WebSocket listener for accepting incoming connections.
///
/// TCP connections are accepted by a background task and each upgrade runs
/// in its own task, so a client that never finishes its handshake only
/// holds up itself. [`TransportListener::accept`] yields upgraded
/// connections in the order their handshakes complete.
pub struct WebSocketListener {
    local_addr: SocketAddr,
    config: WebSocketConfig,
    ready: Mutex<mpsc::Receiver<Accepted>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for WebSocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketListener")
            .field("local_addr", &self.local_addr)
            .field("path", &self.config.path)
            .finish()
    }
}

impl WebSocketListener {
    pub async fn bind(bind_addr: SocketAddr, config: WebSocketConfig) -> TransportResult<Self> {
        config.validate()?;

        let tcp_listener =
            TcpListener::bind(bind_addr)
                .await
                .map_err(|e| TransportError::BindError {
                    address: bind_addr.to_string(),
                    reason: e.to_string(),
                })?;

        let local_addr = tcp_listener.local_addr().map_err(TransportError::IoError)?;
        info!(
            "WebSocket listener bound to ws://{}{}",
            local_addr, config.path
        );

        let (ready_tx, ready_rx) = mpsc::channel(backhaul_transport::CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(
            tcp_listener,
            config.clone(),
            ready_tx,
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            config,
            ready: Mutex::new(ready_rx),
            shutdown,
        })
    }
}

impl Drop for WebSocketListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Accept TCP connections and hand each one to its own upgrade task
async fn accept_loop(
    tcp_listener: TcpListener,
    config: WebSocketConfig,
    ready: mpsc::Sender<Accepted>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = tcp_listener.accept() => accepted,
        };

        match accepted {
            Ok((tcp_stream, remote_addr)) => {
                debug!("Incoming TCP connection from {}", remote_addr);
                tokio::spawn(upgrade(
                    tcp_stream,
                    remote_addr,
                    config.clone(),
                    ready.clone(),
                ));
            }
            Err(e) => {
                if ready.send(Err(TransportError::IoError(e))).await.is_err() {
                    break;
                }
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
            }
        }
    }

    debug!("WebSocket accept loop ended");
}

/// Run the WebSocket handshake for one client.
///
/// A failed or timed out handshake only affects that client.
async fn upgrade(
    tcp_stream: TcpStream,
    remote_addr: SocketAddr,
    config: WebSocketConfig,
    ready: mpsc::Sender<Accepted>,
) {
    let callback = |req: &Request, response: Response| {
        let path = req.uri().path();
        if config.accepts_path(path) {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(None);
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    let handshake = tokio_tungstenite::accept_hdr_async(tcp_stream, callback);
    let ws_stream = match tokio::time::timeout(config.handshake_timeout, handshake).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("WebSocket handshake failed from {}: {}", remote_addr, e);
            return;
        }
        Err(_) => {
            warn!(
                timeout = ?config.handshake_timeout,
                "WebSocket handshake from {} timed out", remote_addr
            );
            return;
        }
    };

    debug!("WebSocket connection established from {}", remote_addr);
    if ready
        .send(Ok((spawn_connection(ws_stream), remote_addr)))
        .await
        .is_err()
    {
        debug!("Listener dropped, discarding connection from {}", remote_addr);
    }
}

#[async_trait]
impl TransportListener for WebSocketListener {
    async fn accept(&self) -> TransportResult<(Connection, SocketAddr)> {
        let mut ready = self.ready.lock().await;
        match ready.recv().await {
            Some(accepted) => accepted,
            None => Err(TransportError::ConnectionError(format!(
                "WebSocket listener on {} closed",
                self.local_addr
            ))),
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }
}

/// WebSocket connector for establishing outgoing connections
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

/// Check that `target` is a `ws://` or `wss://` URL with a host
pub fn parse_url(target: &str) -> TransportResult<Url> {
    let url = Url::parse(target)
        .map_err(|e| TransportError::ConfigurationError(format!("Invalid URL {}: {}", target, e)))?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(TransportError::ConfigurationError(format!(
                "Unsupported URL scheme '{}' (expected ws or wss)",
                other
            )))
        }
    }

    if url.host_str().is_none() {
        return Err(TransportError::ConfigurationError(format!(
            "URL {} has no host",
            target
        )));
    }

    Ok(url)
}

fn map_connect_error(target: &str, error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            TransportError::ConnectionRefused(target.to_string())
        }
        other => TransportError::ConnectionError(format!(
            "WebSocket connect to {} failed: {}",
            target, other
        )),
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self, target: &str) -> TransportResult<Connection> {
        let url = parse_url(target)?;
        if url.scheme() == "wss" {
            ensure_crypto_provider();
        }

        debug!("Connecting to WebSocket server: {}", url);

        let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| map_connect_error(target, e))?;

        debug!("WebSocket connection established to {}", url);
        Ok(spawn_connection(ws_stream))
    }
}
