//! Combined sequence numbers.
//!
//! The last six bytes of every nonce form a 48-bit counter, split into a
//! 16-bit overflow number and a 32-bit sequence number. The counter is
//! strictly increasing per (sender, receiver) pair; wrapping past
//! 2^48 - 1 is a protocol error, not a silent reset.

use rand::rngs::OsRng;
use rand::Rng;

use crate::error::ProtocolError;

/// Largest representable combined sequence number.
pub const CSN_MAX: u64 = (1 << 48) - 1;

/// A combined sequence number as carried in a single nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CsnSnapshot {
    overflow: u16,
    sequence: u32,
}

impl CsnSnapshot {
    pub fn new(overflow: u16, sequence: u32) -> Self {
        CsnSnapshot { overflow, sequence }
    }

    pub fn overflow(self) -> u16 {
        self.overflow
    }

    pub fn sequence(self) -> u32 {
        self.sequence
    }

    /// The full 48-bit value.
    pub fn value(self) -> u64 {
        (u64::from(self.overflow) << 32) | u64::from(self.sequence)
    }

    pub fn from_value(value: u64) -> Option<Self> {
        if value > CSN_MAX {
            return None;
        }
        Some(CsnSnapshot {
            overflow: (value >> 32) as u16,
            sequence: value as u32,
        })
    }
}

/// The server's outgoing counter towards one client.
///
/// Starts with overflow zero and a random 32-bit sequence number, then
/// increments by exactly one per packed message.
#[derive(Debug)]
pub struct OutgoingCsn {
    next: u64,
}

impl OutgoingCsn {
    /// Create a counter with a random initial sequence number.
    pub fn generate() -> Self {
        OutgoingCsn {
            next: u64::from(OsRng.gen::<u32>()),
        }
    }

    #[cfg(test)]
    pub fn starting_at(value: u64) -> Self {
        OutgoingCsn { next: value }
    }

    /// Take the next value, advancing the counter.
    pub fn take(&mut self) -> Result<CsnSnapshot, ProtocolError> {
        let snapshot = CsnSnapshot::from_value(self.next).ok_or(ProtocolError::Overflow)?;
        self.next += 1;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_value_layout() {
        let csn = CsnSnapshot::new(0x0102, 0x0304_0506);
        assert_eq!(csn.value(), 0x0102_0304_0506);
        assert_eq!(CsnSnapshot::from_value(0x0102_0304_0506), Some(csn));
    }

    #[test]
    fn from_value_rejects_past_48_bits() {
        assert!(CsnSnapshot::from_value(CSN_MAX).is_some());
        assert!(CsnSnapshot::from_value(CSN_MAX + 1).is_none());
    }

    #[test]
    fn take_increments() {
        let mut csn = OutgoingCsn::starting_at(41);
        assert_eq!(csn.take().unwrap().value(), 41);
        assert_eq!(csn.take().unwrap().value(), 42);
    }

    #[test]
    fn take_fails_on_wrap() {
        let mut csn = OutgoingCsn::starting_at(CSN_MAX);
        assert_eq!(csn.take().unwrap().value(), CSN_MAX);
        assert!(matches!(csn.take(), Err(ProtocolError::Overflow)));
    }

    #[test]
    fn generated_counter_fits_in_32_bits() {
        let mut csn = OutgoingCsn::generate();
        let first = csn.take().unwrap();
        assert_eq!(first.overflow(), 0);
    }
}
