//! WebSocket transport implementation using tokio-tungstenite
//!
//! Each backhaul message is one WebSocket text frame. The relay listens on a
//! plain TCP socket (put a TLS-terminating proxy in front of it for `wss://`),
//! while the connector dials both `ws://` and `wss://` URLs, so the agent can
//! reach a relay behind TLS and a backend on the local network alike.
//!
//! # Features
//!
//! - **Message framing**: one text frame per message, binary frames accepted
//!   when they hold UTF-8
//! - **Keep-alive**: ping/pong handled by tungstenite
//! - **Path filtering**: the listener only upgrades requests on its path

pub mod config;
pub mod connection;
pub mod listener;

pub use config::WebSocketConfig;
pub use connection::spawn_connection;
pub use listener::{parse_url, WebSocketConnector, WebSocketListener};
