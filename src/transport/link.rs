//! Link - one framed, encrypted TCP connection
//!
//! A link owns two tasks. The writer drains a bounded FIFO queue, one write in
//! flight at a time. The reader parses frames out of the byte stream, decrypts
//! them and hands them to a [`FrameHandler`]. Either task failing closes the
//! whole link.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::app::metrics::{
    DECRYPT_FAILURES, FRAMES_RECEIVED, FRAMES_SENT, LINKS_ACTIVE, QUEUE_DROPS,
    RESYNC_BYTES_SKIPPED,
};
use crate::common::{Liveness, Result};
use crate::crypto::{FrameCipher, ShardNonce};
use crate::error::Error;
use crate::protocol::{Frame, FrameParser};

use super::FrameHandler;

/// Read buffer size (64KB)
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// What a sender does when the link queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueuePolicy {
    /// Wait for queue space
    #[default]
    Block,
    /// Drop the frame and count it
    Drop,
}

/// Link construction parameters
#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    pub queue_capacity: usize,
    pub queue_policy: QueuePolicy,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            queue_policy: QueuePolicy::Block,
        }
    }
}

/// One connected link
pub struct Link {
    id: u64,
    peer: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    policy: QueuePolicy,
    liveness: Liveness,
    queued: AtomicU64,
}

impl Link {
    /// Start the reader and writer tasks for `stream`.
    pub fn spawn(
        id: u64,
        stream: TcpStream,
        options: LinkOptions,
        cipher: Arc<dyn FrameCipher>,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));

        let link = Arc::new(Self {
            id,
            peer,
            tx,
            policy: options.queue_policy,
            liveness: Liveness::new(),
            queued: AtomicU64::new(0),
        });

        LINKS_ACTIVE.inc();
        debug!("Link {} up ({})", id, peer);

        tokio::spawn(write_loop(id, writer, rx, link.liveness.clone()));
        tokio::spawn(read_loop(link.clone(), reader, cipher, handler));

        Ok(link)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.liveness.is_cancelled()
    }

    /// Frames accepted into this link's queue so far
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Close the link; both tasks stop and queued frames are discarded.
    pub fn close(&self) {
        self.liveness.cancel();
    }

    /// Resolves once the link has closed for any reason.
    pub async fn closed(&self) {
        self.liveness.cancelled().await
    }

    /// Queue a frame for writing.
    ///
    /// Under `QueuePolicy::Drop` a full queue drops the frame and still
    /// returns `Ok`; only a closed link is an error.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let bytes = frame.to_bytes();

        match self.policy {
            QueuePolicy::Block => {
                self.tx
                    .send(bytes)
                    .await
                    .map_err(|_| Error::ConnectionClosed)?;
            }
            QueuePolicy::Drop => match self.tx.try_send(bytes) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    QUEUE_DROPS.inc();
                    trace!("Link {} queue full, frame dropped", self.id);
                    return Ok(());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(Error::ConnectionClosed);
                }
            },
        }

        self.queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn write_loop(
    id: u64,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    liveness: Liveness,
) {
    loop {
        // A closed link never writes what is still queued
        let bytes = tokio::select! {
            biased;
            _ = liveness.cancelled() => break,
            bytes = rx.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };

        if let Err(e) = writer.write_all(&bytes).await {
            warn!("Link {} write error: {}", id, e);
            break;
        }
        FRAMES_SENT.inc();
    }

    liveness.cancel();
    rx.close();
    let mut lost = 0u64;
    while rx.try_recv().is_ok() {
        lost += 1;
    }
    if lost > 0 {
        QUEUE_DROPS.inc_by(lost);
        debug!("Link {} closed with {} queued frames discarded", id, lost);
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    link: Arc<Link>,
    mut reader: OwnedReadHalf,
    cipher: Arc<dyn FrameCipher>,
    handler: Arc<dyn FrameHandler>,
) {
    let mut parser = FrameParser::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut skipped = 0u64;

    loop {
        let n = tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("Link {} closed by peer", link.id);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("Link {} read error: {}", link.id, e);
                    break;
                }
            },
            _ = link.liveness.cancelled() => break,
        };

        parser.extend(&buf[..n]);
        while let Some(frame) = parser.next_frame() {
            FRAMES_RECEIVED.inc();
            let header = frame.header;
            let mut payload = frame.payload.to_vec();

            if let Err(e) = cipher.decrypt(&ShardNonce::from_header(&header), &mut payload) {
                DECRYPT_FAILURES.inc();
                warn!(
                    "Link {}: dropping frame session={} block={} shard={}: {}",
                    link.id, header.session_id, header.block_id, header.shard_id, e
                );
                continue;
            }
            handler.on_frame(&link, header, payload);
        }

        if parser.skipped() > skipped {
            RESYNC_BYTES_SKIPPED.inc_by(parser.skipped() - skipped);
            skipped = parser.skipped();
        }
    }

    link.liveness.cancel();
    LINKS_ACTIVE.dec();
    handler.on_link_closed(&link);
}
