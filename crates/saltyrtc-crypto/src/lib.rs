#![forbid(unsafe_code)]

//! NaCl key material for the SaltyRTC signalling server.
//!
//! The server handles two kinds of keypairs: a fresh *session* keypair
//! per connection, and optional long-lived *permanent* keypairs loaded
//! from disk. Both are plain curve25519 keys; client traffic is sealed
//! with `crypto_box` (X25519 + XSalsa20-Poly1305).

pub mod digest;
pub mod keys;

pub use crypto_box::{PublicKey, SecretKey};
pub use digest::sha256;
pub use keys::{sign_keys, ensure_distinct_keys, Keypair, PeerBox};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Ciphertext failed authentication or decryption.
    #[error("cannot decrypt payload")]
    DecryptionFailed,

    /// Encryption failed (payload too large for the AEAD).
    #[error("cannot encrypt payload")]
    EncryptionFailed,

    /// Key file or hex string is not a valid 32-byte key.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Two configured permanent keys are identical.
    #[error("repeated permanent keys")]
    RepeatedKeys,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
