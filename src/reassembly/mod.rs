//! Block reassembly
//!
//! Collects decrypted shards per block id and hands back the original byte
//! block once every data shard is present. The same state machine serves the
//! client's downlink and the server's uplink.
//!
//! - The first shard seen for a block fixes its shard count, parity count and
//!   shard size for the block's lifetime.
//! - A shard index is written at most once; later copies are ignored.
//! - Completed block ids are remembered so straggling copies cannot reopen
//!   and re-deliver a block.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::fec::{join_shards, ShardCodec, ShardPlan};
use crate::protocol::FrameHeader;

/// How many completed block ids above the contiguous floor are tracked before
/// the floor is forced forward.
const RETIRED_WINDOW: usize = 1024;

/// Whether parity shards take part in completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryPolicy {
    /// Parity shards are dropped; a block needs every data shard
    #[default]
    RequireAllData,
    /// Parity is kept and rebuilds a single missing data shard
    ParityRecovery,
}

/// Result of feeding one shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// Stored; the block is still incomplete
    Pending,
    /// This shard index was already present
    Duplicate,
    /// Not usable: out of range, wrong size, parity under `RequireAllData`,
    /// or a block that was already delivered
    Dropped,
    /// Every data shard present
    Complete(Vec<u8>),
    /// Completed by rebuilding one data shard from parity
    Recovered(Vec<u8>),
}

/// Per-block shard collection
#[derive(Debug)]
pub struct BlockState {
    shard_count: u16,
    parity_count: u16,
    shard_size: usize,
    shards: Vec<Vec<u8>>,
    present: Vec<bool>,
    parity: Option<Vec<u8>>,
}

impl BlockState {
    fn new(header: &FrameHeader, shard_size: usize) -> Self {
        let count = header.shard_count as usize;
        Self {
            shard_count: header.shard_count,
            parity_count: header.parity_count,
            shard_size,
            shards: vec![Vec::new(); count],
            present: vec![false; count],
            parity: None,
        }
    }

    pub fn shard_count(&self) -> u16 {
        self.shard_count
    }

    pub fn parity_count(&self) -> u16 {
        self.parity_count
    }

    pub fn shard_size(&self) -> usize {
        self.shard_size
    }

    pub fn present(&self) -> &[bool] {
        &self.present
    }

    pub fn missing(&self) -> usize {
        self.present.iter().filter(|p| !**p).count()
    }

    pub fn is_complete(&self) -> bool {
        self.missing() == 0
    }

    fn insert_data(&mut self, index: usize, payload: Vec<u8>) -> Assembly {
        if index >= self.shards.len() || payload.len() != self.shard_size {
            return Assembly::Dropped;
        }
        if self.present[index] {
            return Assembly::Duplicate;
        }
        self.shards[index] = payload;
        self.present[index] = true;
        Assembly::Pending
    }

    fn insert_parity(&mut self, payload: Vec<u8>) -> Assembly {
        if payload.len() != self.shard_size {
            return Assembly::Dropped;
        }
        if self.parity.is_some() {
            return Assembly::Duplicate;
        }
        self.parity = Some(payload);
        Assembly::Pending
    }

    /// Rebuild the single missing data shard if parity allows it.
    fn try_recover(&mut self) -> bool {
        let Some(parity) = self.parity.as_ref() else {
            return false;
        };
        let plan = ShardPlan::new(
            self.shard_count,
            self.parity_count,
            self.shard_size as u32,
            1,
        );
        let codec = ShardCodec::new(plan);
        match codec.recover_one(&self.shards, &self.present, std::slice::from_ref(parity)) {
            Some(shard) => {
                if let Some(index) = self.present.iter().position(|p| !*p) {
                    self.shards[index] = shard;
                    self.present[index] = true;
                }
                true
            }
            None => false,
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        join_shards(&self.shards)
    }
}

/// Completed block ids: everything below `floor`, plus a sparse set above it
#[derive(Debug, Default)]
struct Retired {
    floor: u64,
    above: BTreeSet<u64>,
}

impl Retired {
    fn contains(&self, block_id: u64) -> bool {
        block_id < self.floor || self.above.contains(&block_id)
    }

    /// Record `block_id` as delivered. Returns the new floor if it moved past
    /// ids that never completed.
    fn retire(&mut self, block_id: u64) -> Option<u64> {
        if block_id < self.floor {
            return None;
        }
        self.above.insert(block_id);
        while self.above.remove(&self.floor) {
            self.floor += 1;
        }

        if self.above.len() <= RETIRED_WINDOW {
            return None;
        }
        // Give up on the oldest gaps so the set stays bounded
        while self.above.len() > RETIRED_WINDOW / 2 {
            if let Some(lowest) = self.above.pop_first() {
                self.floor = lowest + 1;
            }
        }
        while self.above.remove(&self.floor) {
            self.floor += 1;
        }
        Some(self.floor)
    }
}

/// Per (session, direction) reassembler
#[derive(Debug, Default)]
pub struct BlockReassembler {
    policy: RecoveryPolicy,
    blocks: HashMap<u64, BlockState>,
    retired: Retired,
}

impl BlockReassembler {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            blocks: HashMap::new(),
            retired: Retired::default(),
        }
    }

    pub fn policy(&self) -> RecoveryPolicy {
        self.policy
    }

    /// Blocks currently waiting for shards
    pub fn pending_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, block_id: u64) -> Option<&BlockState> {
        self.blocks.get(&block_id)
    }

    /// Feed one decrypted shard.
    pub fn accept(&mut self, header: &FrameHeader, payload: Vec<u8>) -> Assembly {
        let block_id = header.block_id;
        if self.retired.contains(block_id) {
            return Assembly::Dropped;
        }

        let is_parity = header.is_parity();
        if !header.is_data() && !is_parity {
            return Assembly::Dropped;
        }
        if is_parity && self.policy == RecoveryPolicy::RequireAllData {
            return Assembly::Dropped;
        }

        let state = match self.blocks.get_mut(&block_id) {
            Some(state) => state,
            None => {
                if header.shard_count == 0 || payload.is_empty() {
                    return Assembly::Dropped;
                }
                self.blocks
                    .entry(block_id)
                    .or_insert_with(|| BlockState::new(header, payload.len()))
            }
        };

        let outcome = if is_parity {
            state.insert_parity(payload)
        } else {
            state.insert_data(header.shard_id as usize, payload)
        };
        if outcome != Assembly::Pending {
            return outcome;
        }

        if state.is_complete() {
            trace!("Block {} complete", block_id);
            return Assembly::Complete(self.finish(block_id));
        }

        if self.policy == RecoveryPolicy::ParityRecovery && state.missing() == 1 && state.try_recover() {
            trace!("Block {} recovered from parity", block_id);
            return Assembly::Recovered(self.finish(block_id));
        }

        Assembly::Pending
    }

    fn finish(&mut self, block_id: u64) -> Vec<u8> {
        let bytes = self
            .blocks
            .remove(&block_id)
            .map(BlockState::into_bytes)
            .unwrap_or_default();

        if let Some(floor) = self.retired.retire(block_id) {
            self.blocks.retain(|id, _| *id >= floor);
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::ShardCodec;
    use crate::protocol::{flags, Direction};

    const PLAN: ShardPlan = ShardPlan {
        shard_count: 4,
        parity_count: 1,
        shard_size: 16,
        copies_per_shard: 2,
    };

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 250) as u8 + 1).collect()
    }

    fn header(block_id: u64, shard_id: u16, flag: u8) -> FrameHeader {
        let mut header = FrameHeader::new(flag, Direction::Uplink, 1, block_id);
        header.shard_id = shard_id;
        header.shard_count = PLAN.shard_count;
        header.parity_count = PLAN.parity_count;
        header
    }

    /// (header, plaintext shard) pairs for one block, copies included
    fn shards(block_id: u64, bytes: &[u8]) -> Vec<(FrameHeader, Vec<u8>)> {
        let encoded = ShardCodec::new(PLAN).encode(bytes);
        let mut out = Vec::new();
        for copy in 0..PLAN.copies_per_shard {
            for (i, shard) in encoded.data.iter().enumerate() {
                let mut h = header(block_id, i as u16, flags::DATA);
                h.copy_seq = copy;
                if copy > 0 {
                    h.flags |= flags::DUPLICATE;
                }
                out.push((h, shard.clone()));
            }
            for shard in &encoded.parity {
                let mut h = header(block_id, PLAN.shard_count, flags::PARITY);
                h.copy_seq = copy;
                out.push((h, shard.clone()));
            }
        }
        out
    }

    #[test]
    fn test_completes_in_any_order() {
        let original = data(50);
        let mut frames = shards(0, &original);
        frames.reverse();

        let mut reassembler = BlockReassembler::new(RecoveryPolicy::RequireAllData);
        let mut delivered = Vec::new();
        for (h, payload) in frames {
            if let Assembly::Complete(bytes) = reassembler.accept(&h, payload) {
                delivered.push(bytes);
            }
        }
        assert_eq!(delivered, vec![original]);
        assert_eq!(reassembler.pending_blocks(), 0);
    }

    #[test]
    fn test_duplicate_changes_state_once() {
        let original = data(50);
        let frames = shards(0, &original);
        let (first_h, first_payload) = frames[0].clone();
        let mut dup_h = first_h;
        dup_h.flags |= flags::DUPLICATE;
        dup_h.copy_seq = 1;

        let mut reassembler = BlockReassembler::default();
        assert_eq!(reassembler.accept(&first_h, first_payload.clone()), Assembly::Pending);
        assert_eq!(reassembler.block(0).unwrap().missing(), 3);

        assert_eq!(reassembler.accept(&dup_h, vec![0xEE; 16]), Assembly::Duplicate);
        let state = reassembler.block(0).unwrap();
        assert_eq!(state.missing(), 3);
        assert_eq!(state.shards[0], first_payload);
    }

    #[test]
    fn test_late_copies_do_not_redeliver() {
        let original = data(40);
        let mut reassembler = BlockReassembler::default();
        let mut completions = 0;
        for (h, payload) in shards(0, &original) {
            match reassembler.accept(&h, payload) {
                Assembly::Complete(_) => completions += 1,
                Assembly::Pending | Assembly::Duplicate | Assembly::Dropped => {}
                Assembly::Recovered(_) => panic!("unexpected recovery"),
            }
        }
        assert_eq!(completions, 1);
        assert_eq!(reassembler.pending_blocks(), 0);
    }

    #[test]
    fn test_missing_shard_stalls_without_recovery() {
        let original = data(50);
        let mut reassembler = BlockReassembler::new(RecoveryPolicy::RequireAllData);
        for (h, payload) in shards(0, &original) {
            if h.is_data() && h.shard_id == 2 {
                continue;
            }
            assert!(!matches!(
                reassembler.accept(&h, payload),
                Assembly::Complete(_) | Assembly::Recovered(_)
            ));
        }
        assert_eq!(reassembler.pending_blocks(), 1);
        assert_eq!(reassembler.block(0).unwrap().missing(), 1);
    }

    #[test]
    fn test_parity_recovers_single_loss() {
        let original = data(50);
        let mut reassembler = BlockReassembler::new(RecoveryPolicy::ParityRecovery);
        let mut result = None;
        for (h, payload) in shards(0, &original) {
            if h.is_data() && h.shard_id == 1 {
                continue;
            }
            if let Assembly::Recovered(bytes) = reassembler.accept(&h, payload) {
                result = Some(bytes);
            }
        }
        assert_eq!(result, Some(original));
        assert_eq!(reassembler.pending_blocks(), 0);
    }

    #[test]
    fn test_parity_cannot_fix_two_losses() {
        let original = data(50);
        let mut reassembler = BlockReassembler::new(RecoveryPolicy::ParityRecovery);
        for (h, payload) in shards(0, &original) {
            if h.is_data() && (h.shard_id == 0 || h.shard_id == 3) {
                continue;
            }
            assert!(!matches!(
                reassembler.accept(&h, payload),
                Assembly::Complete(_) | Assembly::Recovered(_)
            ));
        }
        assert_eq!(reassembler.block(0).unwrap().missing(), 2);
    }

    #[test]
    fn test_parity_dropped_by_default() {
        let mut reassembler = BlockReassembler::default();
        let h = header(0, 4, flags::PARITY);
        assert_eq!(reassembler.accept(&h, vec![1; 16]), Assembly::Dropped);
        assert_eq!(reassembler.pending_blocks(), 0);
    }

    #[test]
    fn test_out_of_range_and_wrong_size() {
        let mut reassembler = BlockReassembler::default();
        assert_eq!(
            reassembler.accept(&header(0, 0, flags::DATA), vec![1; 16]),
            Assembly::Pending
        );
        assert_eq!(
            reassembler.accept(&header(0, 9, flags::DATA), vec![1; 16]),
            Assembly::Dropped
        );
        assert_eq!(
            reassembler.accept(&header(0, 1, flags::DATA), vec![1; 8]),
            Assembly::Dropped
        );
    }

    #[test]
    fn test_first_frame_fixes_geometry() {
        let mut reassembler = BlockReassembler::default();
        let mut h = header(5, 0, flags::DATA);
        h.shard_count = 2;
        reassembler.accept(&h, vec![9; 4]);

        let state = reassembler.block(5).unwrap();
        assert_eq!(state.shard_count(), 2);
        assert_eq!(state.shard_size(), 4);

        let mut other = header(5, 1, flags::DATA);
        other.shard_count = 8;
        assert_eq!(
            reassembler.accept(&other, vec![7; 4]),
            Assembly::Complete(vec![9, 9, 9, 9, 7, 7, 7, 7])
        );
    }

    #[test]
    fn test_independent_blocks() {
        let a = data(20);
        let b: Vec<u8> = data(33).into_iter().rev().collect();
        let mut frames = shards(0, &a);
        frames.extend(shards(1, &b));
        // interleave the two blocks
        frames.sort_by_key(|(h, _)| (h.shard_id, h.block_id));

        let mut reassembler = BlockReassembler::default();
        let mut delivered = Vec::new();
        for (h, payload) in frames {
            if let Assembly::Complete(bytes) = reassembler.accept(&h, payload) {
                delivered.push((h.block_id, bytes));
            }
        }
        delivered.sort();
        assert_eq!(delivered, vec![(0, a), (1, b)]);
    }

    #[test]
    fn test_retired_window_is_bounded() {
        let mut retired = Retired::default();
        // block 0 never completes
        for id in 1..=(RETIRED_WINDOW as u64 + 1) {
            retired.retire(id);
        }
        assert!(retired.above.len() <= RETIRED_WINDOW);
        assert!(retired.floor > 1);
        assert!(retired.contains(0));
    }
}
