#![forbid(unsafe_code)]

//! SaltyRTC signalling server.
//!
//! A WebSocket rendezvous and relay service: one *initiator* and up to
//! 254 *responders* meet on a path keyed by the initiator's public key,
//! authenticate against a per-connection server session key, and then
//! exchange end-to-end encrypted frames the server forwards blindly.

pub mod events;
pub mod path;
pub mod protocol;
pub mod server;
pub mod session;

pub use events::Event;
pub use server::{Server, ServerConfig, ServerHandle};
