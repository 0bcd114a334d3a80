//! Protocol Layer
//!
//! Responsibilities:
//! - Frame wire format, checksum and resynchronization
//! - Control payloads (session open)
//! - Block framing: shard, encrypt, duplicate
//! - Local-facing SOCKS5 handshake

mod block;
mod control;
mod frame;
mod socks5;

pub use block::{control_frame, BlockEncoder};
pub use control::ControlMessage;
pub use frame::{
    checksum, flags, Direction, Frame, FrameHeader, FrameParser, HEADER_LEN, MAGIC,
    MAX_PAYLOAD_LEN, VERSION,
};
pub use socks5::Socks5Inbound;

use async_trait::async_trait;

use crate::common::{Address, AsyncReadWrite, Result};

/// Local-facing handshake collaborator
///
/// Negotiates with the local application and yields the destination it wants
/// to reach. The stream is left positioned at the first byte of payload.
#[async_trait]
pub trait InboundHandshake: Send + Sync {
    async fn handshake(&self, stream: &mut (dyn AsyncReadWrite + Unpin + Send)) -> Result<Address>;

    /// Get protocol name
    fn name(&self) -> &'static str;
}
