//! Session cookies.
//!
//! Each side of a signalling connection picks a 16-byte random cookie
//! once and repeats it in every nonce it sends. Cookie comparisons are
//! constant-time: the handshake echoes cookies back and forth, and an
//! early-exit comparison would leak how many prefix bytes matched.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

/// Length of a cookie in bytes.
pub const COOKIE_LENGTH: usize = 16;

/// A 16-byte random cookie, fresh per role per connection.
#[derive(Clone, Eq)]
pub struct Cookie([u8; COOKIE_LENGTH]);

impl Cookie {
    /// Generate a fresh random cookie from the OS CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; COOKIE_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Cookie(bytes)
    }

    pub fn from_bytes(bytes: [u8; COOKIE_LENGTH]) -> Self {
        Cookie(bytes)
    }

    /// Parse a cookie from a slice of exactly [`COOKIE_LENGTH`] bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; COOKIE_LENGTH] = slice.try_into().ok()?;
        Some(Cookie(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; COOKIE_LENGTH] {
        &self.0
    }
}

impl PartialEq for Cookie {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Cookies are not secret, but keep log output short.
        write!(f, "Cookie({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}
