//! Packet key derivation (HKDF-SHA256)

use super::{CryptoError, KEY_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};

/// Domain separation salt for the packet key
const PACKET_KEY_SALT: &[u8] = b"paqet/kcp";

/// Extracted HKDF state for one secret
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    pub fn new(salt: &[u8], secret: &[u8]) -> Self {
        Self {
            prk: Salt::new(HKDF_SHA256, salt).extract(secret),
        }
    }

    /// Expand a key bound to `info`
    pub fn expand_key(&self, info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut key = [0u8; KEY_LEN];
        self.prk
            .expand(&[info], KeyLen)
            .and_then(|okm| okm.fill(&mut key))
            .map_err(|_| CryptoError::KeyGeneration("HKDF expand failed".to_string()))?;
        Ok(key)
    }
}

struct KeyLen;

impl hkdf::KeyType for KeyLen {
    fn len(&self) -> usize {
        KEY_LEN
    }
}

/// Derive the packet key
///
/// The transport protocol and version are bound into the key, so peers that
/// disagree on either cannot authenticate each other's packets.
pub fn derive_packet_key(
    secret: &[u8],
    protocol: &str,
    version: u8,
) -> Result<[u8; KEY_LEN], CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::KeyGeneration("empty secret".to_string()));
    }
    let info = format!("{}/v{}", protocol, version);
    Hkdf::new(PACKET_KEY_SALT, secret).expand_key(info.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_depends_on_info() {
        let hkdf = Hkdf::new(b"salt", b"input keying material");
        let first = hkdf.expand_key(b"one").unwrap();
        assert_ne!(first, hkdf.expand_key(b"two").unwrap());
        assert_eq!(first, hkdf.expand_key(b"one").unwrap());
    }

    #[test]
    fn test_packet_key_deterministic() {
        let a = derive_packet_key(b"shared secret", "kcp", 1).unwrap();
        let b = derive_packet_key(b"shared secret", "kcp", 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_packet_key_binds_context() {
        let base = derive_packet_key(b"shared secret", "kcp", 1).unwrap();
        assert_ne!(base, derive_packet_key(b"shared secreT", "kcp", 1).unwrap());
        assert_ne!(base, derive_packet_key(b"shared secret", "kcp", 2).unwrap());
        assert_ne!(base, derive_packet_key(b"shared secret", "udp", 1).unwrap());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(derive_packet_key(b"", "kcp", 1).is_err());
    }
}
