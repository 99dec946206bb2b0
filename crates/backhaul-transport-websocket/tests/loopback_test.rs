//! WebSocket transport over a real loopback socket

use backhaul_transport::{TransportConnector, TransportError, TransportListener};
use backhaul_transport_websocket::{WebSocketConfig, WebSocketConnector, WebSocketListener};
use futures_util::SinkExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

async fn bind(config: WebSocketConfig) -> (WebSocketListener, String) {
    let listener = WebSocketListener::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().unwrap();
    (listener, format!("ws://{}", addr))
}

#[tokio::test]
async fn test_messages_flow_both_ways() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let (listener, base_url) = bind(WebSocketConfig::default().with_path("/tunnel")).await;

    let accept = tokio::spawn(async move { listener.accept().await });

    let client = WebSocketConnector::new()
        .connect(&format!("{}/tunnel", base_url))
        .await
        .expect("Failed to connect");
    let (server, _remote) = timeout(Duration::from_secs(5), accept)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let (client_tx, mut client_rx) = client.split();
    let (server_tx, mut server_rx) = server.split();

    client_tx.send(r#"{"ping":1}"#).await.unwrap();
    client_tx.send(r#"{"ping":2}"#).await.unwrap();

    let first = timeout(Duration::from_secs(5), server_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = timeout(Duration::from_secs(5), server_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.as_deref(), Some(r#"{"ping":1}"#));
    assert_eq!(second.as_deref(), Some(r#"{"ping":2}"#));

    server_tx.send(r#"{"pong":1}"#).await.unwrap();
    let reply = timeout(Duration::from_secs(5), client_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.as_deref(), Some(r#"{"pong":1}"#));

    // Closing one side is observed by the other
    client_tx.close().await;
    let closed = timeout(Duration::from_secs(5), server_rx.recv()).await.unwrap();
    assert!(matches!(closed, Ok(None) | Err(_)));
}

#[tokio::test]
async fn test_idle_socket_does_not_block_accept() {
    let (listener, base_url) = bind(WebSocketConfig::default()).await;
    let addr = listener.local_addr().unwrap();

    // Connected at the TCP level but never sends an upgrade request
    let _idle = TcpStream::connect(addr).await.unwrap();

    let accept = tokio::spawn(async move { listener.accept().await });
    let client = timeout(Duration::from_secs(5), WebSocketConnector::new().connect(&base_url))
        .await
        .expect("connect stalled behind the idle socket")
        .unwrap();
    let (server, _remote) = timeout(Duration::from_secs(5), accept)
        .await
        .expect("accept stalled behind the idle socket")
        .unwrap()
        .unwrap();

    client.sender.send("hello").await.unwrap();
    let (_server_tx, mut server_rx) = server.split();
    let received = timeout(Duration::from_secs(5), server_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_stalled_handshake_is_dropped() {
    let config = WebSocketConfig::default().with_handshake_timeout(Duration::from_millis(200));
    let (listener, _base_url) = bind(config).await;
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let mut idle = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = timeout(
        Duration::from_secs(5),
        tokio::io::AsyncReadExt::read(&mut idle, &mut buf),
    )
    .await
    .expect("listener kept the stalled socket open");
    // EOF or reset, either way the server hung up
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_binary_frames_are_delivered_as_text() {
    let (listener, base_url) = bind(WebSocketConfig::default()).await;
    let accept = tokio::spawn(async move { listener.accept().await });

    let (mut raw, _response) = tokio_tungstenite::connect_async(base_url.as_str())
        .await
        .expect("Failed to connect");
    let (server, _remote) = timeout(Duration::from_secs(5), accept)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let (_server_tx, mut server_rx) = server.split();

    raw.send(Message::Binary(br#"{"ping":1}"#.to_vec()))
        .await
        .unwrap();
    // Not UTF-8: skipped, the connection stays up
    raw.send(Message::Binary(vec![0xff, 0xfe, 0xfd])).await.unwrap();
    raw.send(Message::Text("after".to_string())).await.unwrap();

    let first = timeout(Duration::from_secs(5), server_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = timeout(Duration::from_secs(5), server_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.as_deref(), Some(r#"{"ping":1}"#));
    assert_eq!(second.as_deref(), Some("after"));
}

#[tokio::test]
async fn test_wrong_path_is_rejected() {
    let (listener, base_url) = bind(WebSocketConfig::default().with_path("/tunnel")).await;
    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let result = WebSocketConnector::new()
        .connect(&format!("{}/elsewhere", base_url))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_connect_to_closed_port_is_refused() {
    let port = {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    };

    let err = WebSocketConnector::new()
        .connect(&format!("ws://127.0.0.1:{}", port))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectionRefused(_)));
}

#[tokio::test]
async fn test_invalid_url_is_rejected_before_dialing() {
    let err = WebSocketConnector::new()
        .connect("http://127.0.0.1:1")
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ConfigurationError(_)));
}
