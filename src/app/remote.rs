//! Remote connector
//!
//! Server side of one session: connects to the destination, writes reassembled
//! uplink blocks to it and sends everything it reads back as downlink blocks
//! over the link that carried the session's open frame.
//!
//! Uplink shards reach the connector from any pool link, so losing the open
//! link only silences the downlink. Destination EOF sends SESSION_CLOSE; the
//! connector ends when both directions are done or on any failure, which is
//! reported to the client with SESSION_RESET.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, trace};

use crate::common::{Address, Liveness, Registry};
use crate::crypto::FrameCipher;
use crate::fec::ShardPlan;
use crate::protocol::{control_frame, BlockEncoder, ControlMessage, Direction, Frame, FrameHeader};
use crate::reassembly::RecoveryPolicy;
use crate::transport::Link;

use super::metrics::{format_bytes, SESSIONS_ACTIVE};
use super::relay::{read_size, write_blocks, BlockInbox};

/// Server-side half of one session
pub struct RemoteConnector {
    session_id: u64,
    destination: Address,
    link: Weak<Link>,
    link_id: u64,
    liveness: Liveness,
    uplink: Mutex<BlockInbox>,
    pending: Mutex<Option<UnboundedReceiver<Vec<u8>>>>,
    remote_reset: AtomicBool,
}

impl RemoteConnector {
    pub fn new(session_id: u64, destination: Address, link: &Arc<Link>, recovery: RecoveryPolicy) -> Self {
        let (inbox, pending) = BlockInbox::new(recovery);
        Self {
            session_id,
            destination,
            link: Arc::downgrade(link),
            link_id: link.id(),
            liveness: Liveness::new(),
            uplink: Mutex::new(inbox),
            pending: Mutex::new(Some(pending)),
            remote_reset: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn destination(&self) -> &Address {
        &self.destination
    }

    /// Id of the inbound link downlink frames go back on
    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn close(&self) {
        self.liveness.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.liveness.is_cancelled()
    }

    /// Feed one decrypted uplink frame. Finished blocks are queued for the
    /// destination, so shards may arrive before the connect completes.
    pub fn deliver(&self, header: &FrameHeader, payload: Vec<u8>) {
        if self.is_closed() {
            return;
        }
        if header.is_control() {
            self.on_control(&payload);
            return;
        }
        if self.uplink.lock().accept(header, payload) {
            trace!("Session {}: uplink block {} ready", self.session_id, header.block_id);
        }
    }

    fn on_control(&self, payload: &[u8]) {
        match ControlMessage::decode(payload) {
            Ok(ControlMessage::Close { blocks }) => {
                debug!("Session {}: client closed after {} blocks", self.session_id, blocks);
                self.uplink.lock().finish_at(blocks);
            }
            Ok(ControlMessage::Reset) => {
                debug!("Session {}: reset by client", self.session_id);
                self.remote_reset.store(true, Ordering::SeqCst);
                self.close();
            }
            Ok(ControlMessage::Open { .. }) => {
                trace!("Session {}: duplicate open ignored", self.session_id);
            }
            Err(e) => debug!("Session {}: ignoring control payload: {}", self.session_id, e),
        }
    }

    /// Connect and relay until both sides end or the session fails, then
    /// leave `registry`.
    pub async fn run(
        self: Arc<Self>,
        plan: ShardPlan,
        cipher: Arc<dyn FrameCipher>,
        registry: Arc<Registry<RemoteConnector>>,
    ) {
        let start = Instant::now();
        let (up, down) = self.relay(plan, cipher.clone()).await;

        if self.liveness.is_cancelled() && !self.remote_reset.load(Ordering::SeqCst) {
            self.send_control(cipher.as_ref(), &ControlMessage::Reset).await;
        }
        self.liveness.cancel();
        registry.remove_entry(self.session_id, &self);
        SESSIONS_ACTIVE.dec();
        info!(
            "Session {} closed: {} (↑{} ↓{} {:?})",
            self.session_id,
            self.destination,
            format_bytes(up),
            format_bytes(down),
            start.elapsed()
        );
    }

    async fn relay(&self, plan: ShardPlan, cipher: Arc<dyn FrameCipher>) -> (u64, u64) {
        let pending = self.pending.lock().take();
        let Some(pending) = pending else {
            return (0, 0);
        };

        let stream = tokio::select! {
            result = self.destination.connect() => result,
            _ = self.liveness.cancelled() => return (0, 0),
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    "Session {}: connect to {} failed: {}",
                    self.session_id, self.destination, e
                );
                self.liveness.cancel();
                return (0, 0);
            }
        };
        debug!("Session {} connected to {}", self.session_id, self.destination);

        let (mut reader, writer) = stream.into_split();
        let uplink = tokio::spawn(write_blocks(writer, pending, self.liveness.clone()));

        let mut encoder = BlockEncoder::new(self.session_id, Direction::Downlink, plan, cipher.clone());
        let mut buf = vec![0u8; read_size(&plan)];
        let mut down: u64 = 0;

        while !self.liveness.is_cancelled() {
            let n = tokio::select! {
                result = reader.read(&mut buf) => match result {
                    Ok(0) => {
                        debug!("Session {}: destination EOF after {} blocks", self.session_id, encoder.next_block_id());
                        let close = ControlMessage::Close { blocks: encoder.next_block_id() };
                        self.send_control(cipher.as_ref(), &close).await;
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Session {} destination read error: {}", self.session_id, e);
                        self.liveness.cancel();
                        break;
                    }
                },
                _ = self.liveness.cancelled() => break,
            };

            let frames = match encoder.encode(&buf[..n]) {
                Ok(frames) => frames,
                Err(e) => {
                    error!("Session {}: encode failed: {}", self.session_id, e);
                    self.liveness.cancel();
                    break;
                }
            };
            self.send_downlink(&frames).await;
            down += n as u64;
        }

        // The uplink keeps draining after destination EOF
        let up = uplink.await.unwrap_or(0);
        (up, down)
    }

    /// Send on the open link. Once that link is gone the frames are dropped
    /// and reading carries on.
    async fn send_downlink(&self, frames: &[Frame]) {
        let Some(link) = self.link.upgrade() else {
            trace!("Session {}: inbound link gone, downlink dropped", self.session_id);
            return;
        };
        for frame in frames {
            if link.send(frame).await.is_err() {
                trace!("Session {}: inbound link closed, downlink dropped", self.session_id);
                return;
            }
        }
    }

    async fn send_control(&self, cipher: &dyn FrameCipher, message: &ControlMessage) {
        match control_frame(cipher, self.session_id, Direction::Downlink, message) {
            Ok(frame) => self.send_downlink(std::slice::from_ref(&frame)).await,
            Err(e) => error!("Session {}: control encode failed: {}", self.session_id, e),
        }
    }
}
