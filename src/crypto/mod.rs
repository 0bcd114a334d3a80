//! Cryptography module for Scatter
//!
//! Every frame payload is encrypted independently, keyed by the tuple
//! (session id, block id, shard id, direction). Two interchangeable ciphers:
//! - Keystream: xorshift128+ keystream, obfuscation only, no external crypto
//! - XChaCha20-Poly1305: authenticated, nonce derived from the tuple
//!
//! Both require the tuple to be unique per encryption under one key. Block ids
//! are monotonic per session and direction, and parity shards use ids above
//! the data shard range, which is what keeps it unique.

mod aead;
mod keystream;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use aead::XChaChaCipher;
pub use keystream::KeystreamCipher;

use crate::error::{Error, Result};
use crate::protocol::Direction;

/// Hex encoding of the built-in pre-shared key. Only meant for bootstrapping.
pub const DEFAULT_KEY_HEX: &str =
    "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

/// The per-frame tuple every cipher derives its nonce from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardNonce {
    pub session_id: u64,
    pub block_id: u64,
    pub shard_id: u16,
    pub direction: u8,
}

impl ShardNonce {
    pub fn new(session_id: u64, block_id: u64, shard_id: u16, direction: Direction) -> Self {
        Self {
            session_id,
            block_id,
            shard_id,
            direction: direction.as_u8(),
        }
    }

    /// Nonce for a received header
    pub fn from_header(header: &crate::protocol::FrameHeader) -> Self {
        Self {
            session_id: header.session_id,
            block_id: header.block_id,
            shard_id: header.shard_id,
            direction: header.direction,
        }
    }
}

/// Cipher types supported
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherKind {
    #[default]
    Keystream,
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
}

impl CipherKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "keystream" | "xor" => Some(CipherKind::Keystream),
            "xchacha20-poly1305" | "xchacha20poly1305" | "aead" => {
                Some(CipherKind::XChaCha20Poly1305)
            }
            _ => None,
        }
    }

    /// Bytes an encrypted payload grows by
    pub fn overhead(&self) -> usize {
        match self {
            CipherKind::Keystream => 0,
            CipherKind::XChaCha20Poly1305 => aead::TAG_SIZE,
        }
    }
}

/// Per-frame cipher capability
pub trait FrameCipher: Send + Sync {
    /// Replace the key
    fn set_key(&mut self, key: &[u8]);

    /// Encrypt `data` in place for the given tuple
    fn encrypt(&self, nonce: &ShardNonce, data: &mut Vec<u8>) -> Result<()>;

    /// Decrypt `data` in place. Fails if authentication fails.
    fn decrypt(&self, nonce: &ShardNonce, data: &mut Vec<u8>) -> Result<()>;

    fn kind(&self) -> CipherKind;
}

/// Build a keyed cipher of the given kind
pub fn build_cipher(kind: CipherKind, key: &[u8]) -> Arc<dyn FrameCipher> {
    let mut cipher: Box<dyn FrameCipher> = match kind {
        CipherKind::Keystream => Box::new(KeystreamCipher::new()),
        CipherKind::XChaCha20Poly1305 => Box::new(XChaChaCipher::new()),
    };
    cipher.set_key(key);
    Arc::from(cipher)
}

/// Decode a hex key, falling back to the built-in key when empty.
pub fn decode_key(hex_key: Option<&str>) -> Result<Vec<u8>> {
    let text = hex_key.map(str::trim).filter(|s| !s.is_empty()).unwrap_or(DEFAULT_KEY_HEX);
    hex::decode(text).map_err(|e| Error::Config(format!("Invalid hex key: {}", e)))
}

/// Compute SHA-256 hash
pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_key_default() {
        let key = decode_key(None).unwrap();
        assert_eq!(key.len(), 32);
        assert_eq!(key[0], 0x00);
        assert_eq!(key[1], 0x11);
        assert_eq!(decode_key(Some("  ")).unwrap(), key);
    }

    #[test]
    fn test_decode_key_invalid() {
        assert!(decode_key(Some("abc")).is_err());
        assert!(decode_key(Some("zz")).is_err());
    }

    #[test]
    fn test_cipher_kind_from_str() {
        assert_eq!(CipherKind::from_str("keystream"), Some(CipherKind::Keystream));
        assert_eq!(
            CipherKind::from_str("XChaCha20-Poly1305"),
            Some(CipherKind::XChaCha20Poly1305)
        );
        assert_eq!(CipherKind::from_str("rot13"), None);
    }

    #[test]
    fn test_build_cipher_kinds() {
        let key = decode_key(None).unwrap();
        for kind in [CipherKind::Keystream, CipherKind::XChaCha20Poly1305] {
            let cipher = build_cipher(kind, &key);
            assert_eq!(cipher.kind(), kind);

            let nonce = ShardNonce::new(1, 2, 3, Direction::Uplink);
            let mut data = b"Hello, World!".to_vec();
            cipher.encrypt(&nonce, &mut data).unwrap();
            assert_eq!(data.len(), 13 + kind.overhead());
            cipher.decrypt(&nonce, &mut data).unwrap();
            assert_eq!(data, b"Hello, World!");
        }
    }

    #[test]
    fn test_sha256() {
        let hash = sha256(b"hello");
        assert_eq!(hash.len(), 32);
    }
}
