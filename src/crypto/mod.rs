//! Cryptographic primitives for paqet
//!
//! This module provides:
//! - ChaCha20-Poly1305 packet sealing with salted counter nonces
//! - HKDF-SHA256 derivation of the packet key from the shared secret
//! - Secure random number generation and secret generation

mod aead;
mod kdf;

pub use aead::{Opened, PacketKey, PacketOpener, PacketSealer};
pub use kdf::{derive_packet_key, Hkdf};

use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of the random per-sealer nonce prefix
pub const SALT_LEN: usize = 4;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Bytes added to every sealed packet
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Length of secrets produced by [`generate_secret`]
pub const SECRET_LEN: usize = 32;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Sealed packet truncated: {0} bytes")]
    Truncated(usize),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Random number generator failure")]
    Random,
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Random)
}

/// Generate a printable shared secret for `transport.kcp.key`
pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}
