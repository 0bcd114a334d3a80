//! Block framing
//!
//! Turns one chunk of stream data into the encrypted, duplicated frames that
//! go on the wire: every data shard first, then parity, each repeated
//! `copies_per_shard` times with the copy number in `copy_seq`.

use std::sync::Arc;

use bytes::Bytes;

use crate::crypto::{FrameCipher, ShardNonce};
use crate::error::Result;
use crate::fec::{ShardCodec, ShardPlan};

use super::control::ControlMessage;
use super::frame::{flags, Direction, Frame, FrameHeader};

/// Outbound block encoder for one session and direction
///
/// Owns the monotonic block id counter, which together with the parity shard
/// offset keeps every (session, block, shard, direction) tuple unique.
pub struct BlockEncoder {
    session_id: u64,
    direction: Direction,
    codec: ShardCodec,
    cipher: Arc<dyn FrameCipher>,
    next_block_id: u64,
}

impl BlockEncoder {
    pub fn new(
        session_id: u64,
        direction: Direction,
        plan: ShardPlan,
        cipher: Arc<dyn FrameCipher>,
    ) -> Self {
        Self {
            session_id,
            direction,
            codec: ShardCodec::new(plan),
            cipher,
            next_block_id: 0,
        }
    }

    /// Block id the next call to `encode` will use
    pub fn next_block_id(&self) -> u64 {
        self.next_block_id
    }

    /// Encode one chunk into wire frames, consuming a block id.
    pub fn encode(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        let plan = *self.codec.plan();
        let block_id = self.next_block_id;
        self.next_block_id += 1;

        let encoded = self.codec.encode(data);
        let mut frames = Vec::with_capacity(plan.frames_per_block());

        let shards = encoded
            .data
            .into_iter()
            .enumerate()
            .map(|(i, shard)| (flags::DATA, i as u16, shard))
            .chain(
                encoded
                    .parity
                    .into_iter()
                    .enumerate()
                    .map(|(i, shard)| (flags::PARITY, plan.shard_count + i as u16, shard)),
            );

        for (kind, shard_id, mut payload) in shards {
            let nonce = ShardNonce::new(self.session_id, block_id, shard_id, self.direction);
            self.cipher.encrypt(&nonce, &mut payload)?;
            let payload = Bytes::from(payload);

            let mut header = FrameHeader::new(kind, self.direction, self.session_id, block_id);
            header.shard_id = shard_id;
            header.shard_count = plan.shard_count;
            header.parity_count = plan.parity_count;

            for copy in 0..plan.copies_per_shard {
                let mut header = header;
                header.copy_seq = copy;
                if copy > 0 {
                    header.flags |= flags::DUPLICATE;
                }
                frames.push(Frame::new(header, payload.clone()));
            }
        }

        Ok(frames)
    }
}

/// Build the encrypted CONTROL frame for `message`.
///
/// OPEN is keyed as block 0, shard 0. CLOSE is keyed by its block count, an
/// id its sender never uses for data, and RESET by `u64::MAX`.
pub fn control_frame(
    cipher: &dyn FrameCipher,
    session_id: u64,
    direction: Direction,
    message: &ControlMessage,
) -> Result<Frame> {
    let block_id = match message {
        ControlMessage::Open { .. } => 0,
        ControlMessage::Close { blocks } => *blocks,
        ControlMessage::Reset => u64::MAX,
    };

    let mut payload = message.encode()?;
    let nonce = ShardNonce::new(session_id, block_id, 0, direction);
    cipher.encrypt(&nonce, &mut payload)?;

    let header = FrameHeader::new(flags::CONTROL, direction, session_id, block_id);
    Ok(Frame::new(header, payload))
}
