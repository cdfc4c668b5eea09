//! Packet sealing
//!
//! Every KCP packet leaving the node is sealed with ChaCha20-Poly1305 before
//! it becomes a TCP payload:
//!
//! ```text
//! +-----------+-------------+----------------------+---------+
//! | salt (4B) | counter (8B)|   ciphertext (N B)   | tag 16B |
//! +-----------+-------------+----------------------+---------+
//! ```
//!
//! The 12-byte nonce is the salt followed by the big-endian counter. Each
//! sealer draws its own random salt, so two sealers sharing a key never reuse
//! a nonce.

use super::{random_bytes, CryptoError, KEY_LEN, NONCE_LEN, SALT_LEN, TAG_LEN};
use bytes::Bytes;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use std::fmt;
use std::sync::Arc;

/// Shared packet key
pub struct PacketKey {
    key: LessSafeKey,
}

impl PacketKey {
    /// Create a key from 32 raw bytes
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key =
            UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
        })
    }

    /// Derive the key from the configured secret and transport protocol
    pub fn derive(secret: &str, protocol: &str, version: u8) -> Result<Self, CryptoError> {
        let mut raw = super::derive_packet_key(secret.as_bytes(), protocol, version)?;
        let key = Self::new(&raw);
        raw.fill(0);
        key
    }
}

impl fmt::Debug for PacketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PacketKey([REDACTED])")
    }
}

/// Seals outbound packets. One per sending task.
pub struct PacketSealer {
    key: Arc<PacketKey>,
    salt: [u8; SALT_LEN],
    counter: u64,
}

impl PacketSealer {
    pub fn new(key: Arc<PacketKey>) -> Result<Self, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        random_bytes(&mut salt)?;
        Ok(Self {
            key,
            salt,
            counter: 0,
        })
    }

    /// Seal `plaintext`, returning `nonce || ciphertext || tag`
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.next_nonce()?;

        let mut packet = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
        packet.extend_from_slice(&nonce);
        packet.extend_from_slice(plaintext);

        let tag = self
            .key
            .key
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut packet[NONCE_LEN..],
            )
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;
        packet.extend_from_slice(tag.as_ref());

        Ok(packet)
    }

    /// Generate the next nonce
    ///
    /// A sealer keeps one salt for life, since receivers pin it. Once the
    /// counter is spent sealing fails and the session has to be replaced.
    fn next_nonce(&mut self) -> Result<[u8; NONCE_LEN], CryptoError> {
        if self.counter == u64::MAX {
            return Err(CryptoError::Encryption("nonce space exhausted".to_string()));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce[..SALT_LEN].copy_from_slice(&self.salt);
        nonce[SALT_LEN..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        Ok(nonce)
    }

    /// Packets sealed with the current salt
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

/// An authenticated inbound packet
#[derive(Debug, Clone)]
pub struct Opened {
    pub salt: u32,
    pub counter: u64,
    pub plaintext: Bytes,
}

/// Opens inbound packets. Stateless, shared by the dispatcher.
#[derive(Clone)]
pub struct PacketOpener {
    key: Arc<PacketKey>,
}

impl PacketOpener {
    pub fn new(key: Arc<PacketKey>) -> Self {
        Self { key }
    }

    /// Verify and decrypt a sealed packet
    pub fn open(&self, packet: &[u8]) -> Result<Opened, CryptoError> {
        if packet.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated(packet.len()));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&packet[..NONCE_LEN]);

        let mut buffer = packet[NONCE_LEN..].to_vec();
        let plaintext_len = self
            .key
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut buffer,
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?
            .len();
        buffer.truncate(plaintext_len);

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&nonce[..SALT_LEN]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&nonce[SALT_LEN..]);

        Ok(Opened {
            salt: u32::from_be_bytes(salt),
            counter: u64::from_be_bytes(counter),
            plaintext: Bytes::from(buffer),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(secret: &str) -> Arc<PacketKey> {
        Arc::new(PacketKey::derive(secret, "kcp", 1).unwrap())
    }

    #[test]
    fn test_seal_open() {
        let key = key("0123456789abcdef0123456789abcdef");
        let mut sealer = PacketSealer::new(key.clone()).unwrap();
        let opener = PacketOpener::new(key);

        let sealed = sealer.seal(b"kcp segment").unwrap();
        assert_eq!(sealed.len(), b"kcp segment".len() + NONCE_LEN + TAG_LEN);

        let opened = opener.open(&sealed).unwrap();
        assert_eq!(&opened.plaintext[..], b"kcp segment");
        assert_eq!(opened.counter, 0);

        let opened = opener.open(&sealer.seal(b"next").unwrap()).unwrap();
        assert_eq!(opened.counter, 1);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let mut sealer = PacketSealer::new(key("client-secret")).unwrap();
        let opener = PacketOpener::new(key("server-secret"));

        let sealed = sealer.seal(b"hello").unwrap();
        assert!(matches!(
            opener.open(&sealed),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_protocol_bound_into_key() {
        let mut sealer =
            PacketSealer::new(Arc::new(PacketKey::derive("same", "kcp", 1).unwrap())).unwrap();
        let opener = PacketOpener::new(Arc::new(PacketKey::derive("same", "quic", 1).unwrap()));

        assert!(opener.open(&sealer.seal(b"hello").unwrap()).is_err());
    }

    #[test]
    fn test_tamper_detection() {
        let key = key("secret");
        let mut sealer = PacketSealer::new(key.clone()).unwrap();
        let opener = PacketOpener::new(key);

        let mut sealed = sealer.seal(b"Hello, World!").unwrap();
        sealed[NONCE_LEN] ^= 0xFF;
        assert!(opener.open(&sealed).is_err());

        // Nonce is authenticated too
        let mut sealed = sealer.seal(b"Hello, World!").unwrap();
        sealed[NONCE_LEN - 1] ^= 0x01;
        assert!(opener.open(&sealed).is_err());
    }

    #[test]
    fn test_truncated() {
        let opener = PacketOpener::new(key("secret"));
        assert!(matches!(
            opener.open(&[0u8; NONCE_LEN + TAG_LEN - 1]),
            Err(CryptoError::Truncated(_))
        ));
    }

    #[test]
    fn test_exhausted_counter_refuses_to_seal() {
        let key = key("secret");
        let mut sealer = PacketSealer::new(key.clone()).unwrap();
        let opener = PacketOpener::new(key);
        let salt = opener.open(&sealer.seal(b"first").unwrap()).unwrap().salt;

        sealer.counter = u64::MAX - 1;
        let last = opener.open(&sealer.seal(b"last").unwrap()).unwrap();
        assert_eq!(last.salt, salt);
        assert_eq!(last.counter, u64::MAX - 1);

        assert!(matches!(
            sealer.seal(b"one too many"),
            Err(CryptoError::Encryption(_))
        ));
    }

    #[test]
    fn test_sealers_use_distinct_salts() {
        let key = key("secret");
        let mut a = PacketSealer::new(key.clone()).unwrap();
        let mut b = PacketSealer::new(key.clone()).unwrap();
        let opener = PacketOpener::new(key);

        let a = opener.open(&a.seal(b"a").unwrap()).unwrap();
        let b = opener.open(&b.seal(b"b").unwrap()).unwrap();
        // 1 in 2^32 chance of a false failure
        assert_ne!(a.salt, b.salt);
    }
}
