//! Backhaul Protocol Definitions
//!
//! This crate defines the messages exchanged between the public relay and the
//! agent that sits next to the backend, plus the JSON codec used to put them
//! on the wire.
//!
//! Every frame is a JSON object with a `body` discriminator:
//!
//! | body | direction | fields |
//! |---|---|---|
//! | `identify` | agent → relay | |
//! | `new_connection` | relay → agent | `id` |
//! | `del_connection` | relay → agent | `id` |
//! | `acknowledge_new_connection` | agent → relay | `id` |
//! | `data` | relay → agent | `id`, `data` |
//! | `return` | agent → relay | `id`, `data` |
//!
//! Anything a peer sends that is not one of the relay's control messages is
//! treated as opaque payload.

pub mod codec;
pub mod messages;

pub use codec::CodecError;
pub use messages::{MessageKind, PeerId, TunnelMessage};
