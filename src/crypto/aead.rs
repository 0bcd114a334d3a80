//! XChaCha20-Poly1305 frame cipher
//!
//! The 24-byte nonce is the SHA-256 digest of the shard tuple, truncated. Keys
//! that are not exactly 32 bytes are hashed down to 32 bytes.

use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};

use crate::error::{Error, Result};

use super::{sha256, CipherKind, FrameCipher, ShardNonce};

pub const KEY_SIZE: usize = 32;

pub const XNONCE_SIZE: usize = 24;

pub const TAG_SIZE: usize = 16;

/// Authenticated frame cipher
pub struct XChaChaCipher {
    cipher: XChaCha20Poly1305,
}

impl XChaChaCipher {
    /// Create with an all-zero key; call `set_key` before use.
    pub fn new() -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&[0u8; KEY_SIZE])),
        }
    }

    fn derive_nonce(tuple: &ShardNonce) -> [u8; XNONCE_SIZE] {
        let mut buf = [0u8; 8 + 8 + 2 + 1];
        buf[0..8].copy_from_slice(&tuple.session_id.to_le_bytes());
        buf[8..16].copy_from_slice(&tuple.block_id.to_le_bytes());
        buf[16..18].copy_from_slice(&tuple.shard_id.to_le_bytes());
        buf[18] = tuple.direction;

        let digest = sha256(&buf);
        let mut nonce = [0u8; XNONCE_SIZE];
        nonce.copy_from_slice(&digest[..XNONCE_SIZE]);
        nonce
    }
}

impl Default for XChaChaCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCipher for XChaChaCipher {
    fn set_key(&mut self, key: &[u8]) {
        let material: [u8; KEY_SIZE] = match key.len() {
            0 => [0u8; KEY_SIZE],
            KEY_SIZE => {
                let mut k = [0u8; KEY_SIZE];
                k.copy_from_slice(key);
                k
            }
            _ => sha256(key),
        };
        self.cipher = XChaCha20Poly1305::new(Key::from_slice(&material));
    }

    fn encrypt(&self, nonce: &ShardNonce, data: &mut Vec<u8>) -> Result<()> {
        let nonce = Self::derive_nonce(nonce);
        let sealed = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), data.as_slice())
            .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;
        *data = sealed;
        Ok(())
    }

    fn decrypt(&self, nonce: &ShardNonce, data: &mut Vec<u8>) -> Result<()> {
        if data.len() < TAG_SIZE {
            return Err(Error::Crypto("Ciphertext too short".to_string()));
        }

        let nonce = Self::derive_nonce(nonce);
        let opened = self
            .cipher
            .decrypt(XNonce::from_slice(&nonce), data.as_slice())
            .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))?;
        *data = opened;
        Ok(())
    }

    fn kind(&self) -> CipherKind {
        CipherKind::XChaCha20Poly1305
    }
}
