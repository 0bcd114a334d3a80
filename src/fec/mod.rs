//! Shard codec
//!
//! Splits one block of stream data into `shard_count` zero-padded shards of
//! `shard_size` bytes plus at most one XOR parity shard. XOR parity repairs
//! exactly one missing data shard and nothing more; it is not a general
//! erasure code.

use serde::{Deserialize, Serialize};

/// Sharding parameters, configured identically on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPlan {
    pub shard_count: u16,
    pub parity_count: u16,
    pub shard_size: u32,
    pub copies_per_shard: u16,
}

impl ShardPlan {
    pub fn new(shard_count: u16, parity_count: u16, shard_size: u32, copies_per_shard: u16) -> Self {
        Self {
            shard_count,
            parity_count,
            shard_size,
            copies_per_shard,
        }
    }

    /// Largest block that survives encoding without truncation
    pub fn block_capacity(&self) -> usize {
        self.shard_count as usize * self.shard_size as usize
    }

    /// Parity shards actually produced per block (0 or 1)
    pub fn parity_shards(&self) -> u16 {
        self.parity_count.min(1)
    }

    /// Frames emitted per block, copies included
    pub fn frames_per_block(&self) -> usize {
        (self.shard_count as usize + self.parity_shards() as usize) * self.copies_per_shard as usize
    }
}

impl Default for ShardPlan {
    fn default() -> Self {
        Self {
            shard_count: 8,
            parity_count: 1,
            shard_size: 1400,
            copies_per_shard: 2,
        }
    }
}

/// Encoded block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBlock {
    pub data: Vec<Vec<u8>>,
    pub parity: Vec<Vec<u8>>,
}

/// XOR parity shard codec
#[derive(Debug, Clone, Copy)]
pub struct ShardCodec {
    plan: ShardPlan,
}

impl ShardCodec {
    pub fn new(plan: ShardPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &ShardPlan {
        &self.plan
    }

    /// Split `data` into data shards and parity.
    ///
    /// Bytes beyond `block_capacity()` are dropped; callers keep reads within it.
    pub fn encode(&self, data: &[u8]) -> EncodedBlock {
        let shard_size = self.plan.shard_size as usize;
        let mut shards: Vec<Vec<u8>> = (0..self.plan.shard_count)
            .map(|_| vec![0u8; shard_size])
            .collect();

        for (shard, chunk) in shards.iter_mut().zip(data.chunks(shard_size.max(1))) {
            shard[..chunk.len()].copy_from_slice(chunk);
        }

        let mut parity = Vec::new();
        if self.plan.parity_count > 0 {
            let mut p = vec![0u8; shard_size];
            for shard in &shards {
                xor_into(&mut p, shard);
            }
            parity.push(p);
        }

        EncodedBlock { data: shards, parity }
    }

    /// Rebuild the single missing data shard.
    ///
    /// `present_data[i]` is only read where `present_mask[i]` is set. Returns
    /// `None` unless exactly one shard is missing and a parity shard is at hand.
    pub fn recover_one(
        &self,
        present_data: &[Vec<u8>],
        present_mask: &[bool],
        parity_shards: &[Vec<u8>],
    ) -> Option<Vec<u8>> {
        if self.plan.parity_count == 0 {
            return None;
        }
        let parity = parity_shards.first()?;

        let missing = present_mask.iter().filter(|present| !**present).count();
        if missing != 1 {
            return None;
        }

        let mut recovered = vec![0u8; self.plan.shard_size as usize];
        xor_into(&mut recovered, parity);
        for (shard, _) in present_data
            .iter()
            .zip(present_mask)
            .filter(|(_, present)| **present)
        {
            xor_into(&mut recovered, shard);
        }
        Some(recovered)
    }
}

/// Concatenate shards in order and drop the zero padding tail.
///
/// Genuine trailing zero bytes of the original block are dropped as well;
/// the framing carries no true length.
pub fn join_shards(shards: &[Vec<u8>]) -> Vec<u8> {
    let total = shards.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    for shard in shards {
        out.extend_from_slice(shard);
    }
    let end = out.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    out.truncate(end);
    out
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}
