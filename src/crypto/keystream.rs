//! Keystream cipher
//!
//! A xorshift128+ generator keyed from the pre-shared key and reseeded per
//! frame from the shard tuple. The keystream is XORed over the payload, so
//! encrypt and decrypt are the same operation. Obfuscation only: tampering is
//! not detected.

use crate::error::Result;

use super::{CipherKind, FrameCipher, ShardNonce};

/// Odd multiplier spreading block ids across the nonce
const BLOCK_MULTIPLIER: u64 = 0x9e37_79b9_7f4a_7c15;

/// Generator steps discarded after every reseed
const WARMUP_ROUNDS: usize = 8;

const DEFAULT_S0: u64 = 0x1234_5678_9abc_def0;
const DEFAULT_S1: u64 = 0x0fed_cba9_8765_4321;

const SCHEDULE_A: u64 = 0x243f_6a88_85a3_08d3;
const SCHEDULE_B: u64 = 0x1319_8a2e_0370_7344;

#[derive(Debug, Clone, Copy)]
struct Xorshift128Plus {
    s0: u64,
    s1: u64,
}

impl Xorshift128Plus {
    /// An all-zero state never leaves zero, so it is nudged to `s0 = 1`.
    fn seeded(s0: u64, s1: u64) -> Self {
        if s0 == 0 && s1 == 0 {
            return Self { s0: 1, s1: 0 };
        }
        Self { s0, s1 }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.s0;
        let y = self.s1;
        self.s0 = y;
        x ^= x << 23;
        x ^= x >> 17;
        x ^= y ^ (y >> 26);
        self.s1 = x;
        x.wrapping_add(y)
    }

    fn reseed(&mut self, nonce: u64) {
        self.s0 ^= nonce | 1;
        self.s1 ^= (nonce << 1) | 1;
        for _ in 0..WARMUP_ROUNDS {
            self.next();
        }
    }
}

/// Keystream cipher; the keyed state is never mutated by encryption, so one
/// instance is shared freely across tasks.
#[derive(Debug, Clone)]
pub struct KeystreamCipher {
    state: Xorshift128Plus,
}

impl KeystreamCipher {
    pub fn new() -> Self {
        Self {
            state: Xorshift128Plus {
                s0: DEFAULT_S0,
                s1: DEFAULT_S1,
            },
        }
    }

    fn nonce(tuple: &ShardNonce) -> u64 {
        tuple.session_id
            ^ tuple.block_id.wrapping_mul(BLOCK_MULTIPLIER)
            ^ ((tuple.shard_id as u64) << 32)
            ^ tuple.direction as u64
    }

    fn apply(&self, tuple: &ShardNonce, data: &mut [u8]) {
        let mut rng = self.state;
        rng.reseed(Self::nonce(tuple));
        for chunk in data.chunks_mut(8) {
            let ks = rng.next().to_le_bytes();
            for (byte, k) in chunk.iter_mut().zip(ks.iter()) {
                *byte ^= k;
            }
        }
    }
}

impl Default for KeystreamCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCipher for KeystreamCipher {
    fn set_key(&mut self, key: &[u8]) {
        let mut a = SCHEDULE_A;
        let mut b = SCHEDULE_B;
        for (i, &byte) in key.iter().enumerate() {
            a ^= (byte as u64) << ((i % 8) * 8);
            a = a.rotate_left(7);
            b ^= (byte as u64) << (((i + 3) % 8) * 8);
            b = b.rotate_left(11);
        }
        self.state = Xorshift128Plus::seeded(a, b);
    }

    fn encrypt(&self, nonce: &ShardNonce, data: &mut Vec<u8>) -> Result<()> {
        self.apply(nonce, data);
        Ok(())
    }

    fn decrypt(&self, nonce: &ShardNonce, data: &mut Vec<u8>) -> Result<()> {
        self.apply(nonce, data);
        Ok(())
    }

    fn kind(&self) -> CipherKind {
        CipherKind::Keystream
    }
}
