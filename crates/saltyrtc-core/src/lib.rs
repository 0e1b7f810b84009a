#![forbid(unsafe_code)]

//! Core SaltyRTC signalling protocol types and framing.
//!
//! This crate knows the wire format only: receiver addresses, cookies,
//! combined sequence numbers, the 24-byte nonce and the MessagePack
//! message codec. Encryption and connection handling live in the
//! `saltyrtc-crypto` and `saltyrtc-server` crates.

pub mod address;
pub mod close_code;
pub mod cookie;
pub mod csn;
pub mod error;
pub mod message;
pub mod nonce;

pub use address::Address;
pub use close_code::CloseCode;
pub use cookie::Cookie;
pub use csn::{CsnSnapshot, OutgoingCsn};
pub use error::ProtocolError;
pub use message::Message;
pub use nonce::Nonce;

/// The single signalling subprotocol this server speaks.
pub const SUBPROTOCOL: &str = "v1.saltyrtc.org";

/// Length of a NaCl curve25519 key in bytes.
pub const KEY_LENGTH: usize = 32;
