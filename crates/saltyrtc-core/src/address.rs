//! Receiver addresses.
//!
//! Every peer on a path is addressed by a single byte: `0x00` is the
//! server, `0x01` the initiator and `0x02..=0xff` the responders. The
//! same byte doubles as the "unassigned" marker for a responder that has
//! not been given a slot yet.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A receiver address byte as carried in the nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub u8);

/// The server address (also the address of an unassigned responder).
pub const SERVER: Address = Address(0x00);

/// The initiator address.
pub const INITIATOR: Address = Address(0x01);

impl Address {
    /// Whether this address refers to the server.
    pub fn is_server(self) -> bool {
        self.0 == 0x00
    }

    /// Whether this address refers to the initiator.
    pub fn is_initiator(self) -> bool {
        self.0 == 0x01
    }

    /// Whether this address lies in the responder range.
    pub fn is_responder(self) -> bool {
        self.0 >= 0x02
    }
}

impl From<u8> for Address {
    fn from(byte: u8) -> Self {
        Address(byte)
    }
}

impl From<Address> for u8 {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}
