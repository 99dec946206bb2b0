//! Backhaul Agent - private end of the reverse tunnel
//!
//! The agent dials out to the relay, declares itself with `identify` and
//! then re-originates every relayed client against a fixed backend:
//!
//! - `new_connection`: register a [`SpoofedConnection`] and dial the backend
//!   in its own task; once connected, acknowledge upstream and pump backend
//!   output back as `return` messages
//! - `data`: forward the payload to that client's backend connection
//! - `del_connection`: close the client's backend connection
//!
//! When the relay connection ends, every backend connection is closed and
//! the [`Agent`] supervisor reconnects after a fixed delay, forever.
//!
//! # Example
//!
//! ```ignore
//! use backhaul_agent::{Agent, AgentConfig};
//! use backhaul_transport_websocket::WebSocketConnector;
//! use std::sync::Arc;
//!
//! let config = AgentConfig::new("ws://relay.example.com:8765", "ws://localhost:8000");
//! let connector = Arc::new(WebSocketConnector::new());
//! let agent = Agent::new(config, connector.clone(), connector);
//! agent.run().await;
//! ```

pub mod config;
pub mod error;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod spoofed;
pub mod supervisor;

pub use config::{AgentConfig, DEFAULT_RETRY_DELAY};
pub use error::AgentError;
pub use reconnect::RetryTimer;
pub use registry::AgentRegistry;
pub use session::RelaySession;
pub use spoofed::SpoofedConnection;
pub use supervisor::{Agent, AgentState};
