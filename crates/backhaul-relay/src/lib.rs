//! Backhaul Relay - public endpoint of the reverse tunnel
//!
//! The relay accepts transport connections from anyone. One of them declares
//! itself the agent with an `identify` message; every other connection is a
//! peer whose traffic is wrapped with the peer's identifier and forwarded to
//! the agent, while the agent's `return` messages are routed back to the
//! matching peer.
//!
//! # Architecture
//!
//! 1. **Accept**: [`RelayServer`] spawns one handler task per connection
//! 2. **Register**: the handler assigns a fresh [`PeerId`](backhaul_proto::PeerId)
//!    and inserts it into the [`RoutingTable`]
//! 3. **Handshake**: when an agent is attached, the relay sends
//!    `new_connection` and holds the peer's traffic until the agent
//!    acknowledges (see [`PendingAcknowledgements`])
//! 4. **Relay**: messages are dispatched on their `body` tag
//! 5. **Cleanup**: on closure the identifier leaves the table exactly once and
//!    the agent is told with `del_connection`

pub mod error;
pub mod handler;
pub mod pending;
pub mod routing;
pub mod server;

pub use error::RelayError;
pub use handler::handle_connection;
pub use pending::PendingAcknowledgements;
pub use routing::{AgentSlot, PeerConnection, PeerState, RoutingTable};
pub use server::{RelayServer, RelayState};
