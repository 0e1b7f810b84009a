//! Keypairs and per-client boxes.

use std::fs;
use std::path::Path;

use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::rngs::OsRng;
use zeroize::Zeroize;

use crate::CryptoError;

/// Length of a curve25519 key in bytes.
pub const KEY_LENGTH: usize = 32;

/// A curve25519 keypair.
///
/// Used both for the per-connection session key and for the server's
/// permanent keys. The secret key is zeroized on drop by `crypto_box`.
pub struct Keypair {
    secret: SecretKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        Keypair {
            secret: SecretKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Keypair {
            secret: SecretKey::from(bytes),
        }
    }

    /// Parse a keypair from a hex-encoded secret key.
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(hex_key.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("not hex: {e}")))?;
        if bytes.len() != KEY_LENGTH {
            bytes.zeroize();
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        let keypair = Keypair::from_bytes(key);
        key.zeroize();
        Ok(keypair)
    }

    /// Load a keypair from a file containing the hex-encoded secret key.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let mut contents = fs::read_to_string(path)?;
        let keypair = Keypair::from_hex(&contents);
        contents.zeroize();
        keypair
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// The box shared with `peer`.
    pub fn box_with(&self, peer: &PublicKey) -> PeerBox {
        PeerBox {
            inner: SalsaBox::new(peer, &self.secret),
        }
    }
}

/// An authenticated-encryption context bound to one (secret, public)
/// key pair.
pub struct PeerBox {
    inner: SalsaBox,
}

impl PeerBox {
    /// Encrypt `plaintext` under `nonce`.
    pub fn seal(&self, nonce: &[u8; 24], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner
            .encrypt(&(*nonce).into(), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt and authenticate `ciphertext` under `nonce`.
    pub fn open(&self, nonce: &[u8; 24], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner
            .decrypt(&(*nonce).into(), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Build the `signed_keys` value of a `server-auth` message: the
/// concatenation `session_pk ∥ client_pk`, sealed with the permanent
/// key towards the client using the nonce of the carrying message.
pub fn sign_keys(
    permanent: &Keypair,
    client_key: &PublicKey,
    session_key: &PublicKey,
    nonce: &[u8; 24],
) -> Result<Vec<u8>, CryptoError> {
    let mut concatenated = [0u8; KEY_LENGTH * 2];
    concatenated[..KEY_LENGTH].copy_from_slice(session_key.as_bytes());
    concatenated[KEY_LENGTH..].copy_from_slice(client_key.as_bytes());
    permanent.box_with(client_key).seal(nonce, &concatenated)
}

/// Validate that the configured permanent keys are pairwise distinct.
pub fn ensure_distinct_keys(keys: &[Keypair]) -> Result<(), CryptoError> {
    for (i, a) in keys.iter().enumerate() {
        for b in &keys[i + 1..] {
            if a.public_key() == b.public_key() {
                return Err(CryptoError::RepeatedKeys);
            }
        }
    }
    Ok(())
}
