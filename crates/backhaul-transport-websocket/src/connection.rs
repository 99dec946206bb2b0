//! Bridges a tungstenite stream onto a backhaul [`Connection`]

use backhaul_transport::{Connection, ConnectionIo, Outgoing, TransportError, TransportResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Wrap an established WebSocket in a [`Connection`].
///
/// Spawns one writer task and one reader task. The reader ending (remote
/// close, error, EOF) also stops the writer, so senders observe the closure.
pub fn spawn_connection<S>(ws_stream: WebSocketStream<S>) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection_id = format!("ws-{}", uuid::Uuid::new_v4());
    let (connection, io) = Connection::channel(connection_id.clone());
    let ConnectionIo { outgoing, incoming } = io;

    let (sink, source) = ws_stream.split();
    let reader_done = CancellationToken::new();

    let conn_id = connection_id.clone();
    let writer_stop = reader_done.clone();
    tokio::spawn(async move {
        writer_task(sink, outgoing, writer_stop, conn_id).await;
    });

    tokio::spawn(async move {
        reader_task(source, incoming, connection_id).await;
        reader_done.cancel();
    });

    connection
}

/// Writer task - sends queued messages to the WebSocket
async fn writer_task<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Outgoing>,
    reader_done: CancellationToken,
    conn_id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let next = tokio::select! {
            _ = reader_done.cancelled() => {
                debug!("[{}] Reader ended, stopping writer", conn_id);
                break;
            }
            next = rx.recv() => next,
        };

        match next {
            Some(Outgoing::Text(text)) => {
                trace!("[{}] Sending {} bytes", conn_id, text.len());
                if let Err(e) = sink.send(Message::Text(text)).await {
                    error!("[{}] WebSocket send error: {}", conn_id, e);
                    break;
                }
            }
            Some(Outgoing::Close) | None => {
                debug!("[{}] Closing WebSocket", conn_id);
                let _ = sink.close().await;
                break;
            }
        }
    }

    debug!("[{}] WebSocket writer task ended", conn_id);
}

/// Reader task - hands received text frames to the application
async fn reader_task<S>(
    mut source: SplitStream<WebSocketStream<S>>,
    incoming: mpsc::Sender<TransportResult<String>>,
    conn_id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(result) = source.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    warn!("[{}] Dropping non UTF-8 binary frame", conn_id);
                    continue;
                }
            },
            Ok(Message::Ping(_)) => {
                // Pong is automatically handled by tungstenite
                trace!("[{}] Received ping", conn_id);
                continue;
            }
            Ok(Message::Pong(_)) => {
                trace!("[{}] Received pong", conn_id);
                continue;
            }
            Ok(Message::Close(frame)) => {
                debug!("[{}] WebSocket close received: {:?}", conn_id, frame);
                break;
            }
            Ok(Message::Frame(_)) => continue,
            Err(e) => {
                debug!("[{}] WebSocket read error: {}", conn_id, e);
                let _ = incoming
                    .send(Err(TransportError::ConnectionError(e.to_string())))
                    .await;
                break;
            }
        };

        if incoming.send(Ok(text)).await.is_err() {
            trace!("[{}] Receiver dropped, discarding message", conn_id);
        }
    }

    debug!("[{}] WebSocket reader task ended", conn_id);
}
