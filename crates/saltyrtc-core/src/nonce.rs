//! The 24-byte message nonce.
//!
//! Layout: `cookie(16) ∥ source(1) ∥ destination(1) ∥ overflow(2, BE) ∥
//! sequence(4, BE)`. The nonce doubles as the NaCl box nonce for the
//! encrypted payload that follows it on the wire.

use crate::address::Address;
use crate::cookie::{Cookie, COOKIE_LENGTH};
use crate::csn::CsnSnapshot;
use crate::error::ProtocolError;

/// Length of a nonce in bytes.
pub const NONCE_LENGTH: usize = 24;

#[derive(Debug, Clone, PartialEq)]
pub struct Nonce {
    cookie: Cookie,
    source: Address,
    destination: Address,
    csn: CsnSnapshot,
}

impl Nonce {
    pub fn new(cookie: Cookie, source: Address, destination: Address, csn: CsnSnapshot) -> Self {
        Nonce {
            cookie,
            source,
            destination,
            csn,
        }
    }

    /// Parse a nonce from exactly [`NONCE_LENGTH`] bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != NONCE_LENGTH {
            return Err(ProtocolError::Message(format!(
                "invalid nonce length: {}",
                bytes.len()
            )));
        }
        // Length is checked above, the field slices cannot fail.
        let cookie = Cookie::from_slice(&bytes[..COOKIE_LENGTH])
            .ok_or_else(|| ProtocolError::Message("invalid nonce cookie".into()))?;
        let overflow = u16::from_be_bytes([bytes[18], bytes[19]]);
        let sequence = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        Ok(Nonce {
            cookie,
            source: Address(bytes[16]),
            destination: Address(bytes[17]),
            csn: CsnSnapshot::new(overflow, sequence),
        })
    }

    pub fn to_bytes(&self) -> [u8; NONCE_LENGTH] {
        let mut bytes = [0u8; NONCE_LENGTH];
        bytes[..COOKIE_LENGTH].copy_from_slice(self.cookie.as_bytes());
        bytes[16] = self.source.0;
        bytes[17] = self.destination.0;
        bytes[18..20].copy_from_slice(&self.csn.overflow().to_be_bytes());
        bytes[20..].copy_from_slice(&self.csn.sequence().to_be_bytes());
        bytes
    }

    pub fn cookie(&self) -> &Cookie {
        &self.cookie
    }

    pub fn source(&self) -> Address {
        self.source
    }

    pub fn destination(&self) -> Address {
        self.destination
    }

    pub fn csn(&self) -> CsnSnapshot {
        self.csn
    }
}

/// Split a wire frame into its nonce and payload.
pub fn split_frame(frame: &[u8]) -> Result<(Nonce, &[u8]), ProtocolError> {
    if frame.len() < NONCE_LENGTH {
        return Err(ProtocolError::Message(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    let nonce = Nonce::parse(&frame[..NONCE_LENGTH])?;
    Ok((nonce, &frame[NONCE_LENGTH..]))
}

/// Assemble a wire frame from a nonce and payload.
pub fn join_frame(nonce: &Nonce, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(NONCE_LENGTH + payload.len());
    frame.extend_from_slice(&nonce.to_bytes());
    frame.extend_from_slice(payload);
    frame
}
