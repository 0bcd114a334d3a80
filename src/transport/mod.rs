//! Transport Layer
//!
//! Responsibilities:
//! - Own the TCP links that carry frames between client and server
//! - Queue outbound frames per link, parse and decrypt inbound frames
//! - Keep the client's pool of links connected
//!
//! Nothing here knows about sessions; parsed frames go to a [`FrameHandler`].

mod link;
mod pool;

pub use link::{Link, LinkOptions, QueuePolicy};
pub use pool::{LinkPool, PoolConfig};

use std::sync::Arc;

use crate::protocol::FrameHeader;

/// Receives every decrypted frame from a link
///
/// Called from the link's reader task, so implementations must not block.
pub trait FrameHandler: Send + Sync {
    /// A frame was parsed and decrypted on `link`.
    fn on_frame(&self, link: &Arc<Link>, header: FrameHeader, payload: Vec<u8>);

    /// `link` has closed and will deliver no more frames.
    fn on_link_closed(&self, _link: &Arc<Link>) {}
}

/// Handler that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHandler;

impl FrameHandler for NullHandler {
    fn on_frame(&self, _link: &Arc<Link>, _header: FrameHeader, _payload: Vec<u8>) {}
}
