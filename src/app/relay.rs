//! Relay helpers shared by client sessions and server connectors
//!
//! Each side of a session reads one socket into blocks and writes reassembled
//! blocks from the far side into the other. The two directions end on their
//! own: a read EOF becomes a SESSION_CLOSE carrying the block count, and the
//! far side shuts its write half once it has written that many blocks.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::common::Liveness;
use crate::fec::ShardPlan;
use crate::protocol::FrameHeader;
use crate::reassembly::{Assembly, BlockReassembler, RecoveryPolicy};

use super::metrics::{BLOCKS_COMPLETED, BLOCKS_RECOVERED, DUPLICATES_IGNORED};

/// Read buffer size (64KB)
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Largest read that still fits in one block
pub(crate) fn read_size(plan: &ShardPlan) -> usize {
    READ_BUFFER_SIZE.min(plan.block_capacity()).max(1)
}

/// Count a reassembly outcome and hand back the finished block, if any.
pub(crate) fn finished_block(outcome: Assembly) -> Option<Vec<u8>> {
    match outcome {
        Assembly::Complete(block) => {
            BLOCKS_COMPLETED.inc();
            Some(block)
        }
        Assembly::Recovered(block) => {
            BLOCKS_COMPLETED.inc();
            BLOCKS_RECOVERED.inc();
            Some(block)
        }
        Assembly::Duplicate => {
            DUPLICATES_IGNORED.inc();
            None
        }
        Assembly::Pending | Assembly::Dropped => None,
    }
}

/// Incoming direction of one session: reassembly plus the queue of finished
/// blocks for the writer task
pub(crate) struct BlockInbox {
    reassembler: BlockReassembler,
    blocks: Option<UnboundedSender<Vec<u8>>>,
    delivered: u64,
    expected: Option<u64>,
}

impl BlockInbox {
    pub(crate) fn new(policy: RecoveryPolicy) -> (Self, UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inbox = Self {
            reassembler: BlockReassembler::new(policy),
            blocks: Some(tx),
            delivered: 0,
            expected: None,
        };
        (inbox, rx)
    }

    /// Feed one decrypted shard. Returns true if it finished a block.
    pub(crate) fn accept(&mut self, header: &FrameHeader, payload: Vec<u8>) -> bool {
        let Some(block) = finished_block(self.reassembler.accept(header, payload)) else {
            return false;
        };
        self.delivered += 1;
        if let Some(blocks) = &self.blocks {
            let _ = blocks.send(block);
        }
        self.close_if_done();
        true
    }

    /// The far side sent `blocks` blocks in total.
    pub(crate) fn finish_at(&mut self, blocks: u64) {
        self.expected = Some(blocks);
        self.close_if_done();
    }

    /// True once every announced block has been queued for writing
    pub(crate) fn is_finished(&self) -> bool {
        self.blocks.is_none()
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered
    }

    fn close_if_done(&mut self) {
        if self.expected.is_some_and(|n| self.delivered >= n) {
            self.blocks = None;
        }
    }
}

/// Write reassembled blocks in arrival order until the channel closes, then
/// shut the write half down. A failed write cancels the stream. Returns bytes
/// written.
pub(crate) async fn write_blocks<W>(
    mut writer: W,
    mut blocks: UnboundedReceiver<Vec<u8>>,
    liveness: Liveness,
) -> u64
where
    W: AsyncWrite + Unpin,
{
    let mut total: u64 = 0;

    loop {
        let block = tokio::select! {
            block = blocks.recv() => match block {
                Some(block) => block,
                None => break,
            },
            _ = liveness.cancelled() => break,
        };

        if block.is_empty() {
            continue;
        }
        if let Err(e) = writer.write_all(&block).await {
            debug!("Relay write failed: {}", e);
            liveness.cancel();
            break;
        }
        total += block.len() as u64;
    }

    let _ = writer.shutdown().await;
    total
}
