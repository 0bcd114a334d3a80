//! Client session
//!
//! One accepted SOCKS5 connection. After the handshake the session announces
//! its destination with a SESSION_OPEN control frame, then turns every local
//! read into one block of shard frames spread over the link pool. Downlink
//! shards for its id are reassembled and written back to the local socket as
//! blocks complete.
//!
//! Local EOF sends SESSION_CLOSE and leaves the downlink running; the session
//! ends once the server's SESSION_CLOSE has been honoured too. Any failure
//! cancels both directions and tells the server with SESSION_RESET.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, trace, warn};

use crate::common::{Address, Liveness, Registry, Result};
use crate::crypto::FrameCipher;
use crate::fec::ShardPlan;
use crate::protocol::{control_frame, BlockEncoder, ControlMessage, Direction, FrameHeader, InboundHandshake};
use crate::reassembly::RecoveryPolicy;
use crate::transport::{FrameHandler, Link, LinkPool};

use super::metrics::{format_bytes, SESSIONS_ACTIVE, SESSIONS_OPENED};
use super::relay::{read_size, write_blocks, BlockInbox};

/// Session id allocator
///
/// Ids start from a random high half so clients sharing a server are unlikely
/// to collide; the low half counts up from 1.
#[derive(Debug)]
pub struct SessionIds {
    next: AtomicU64,
}

impl SessionIds {
    pub fn new() -> Self {
        Self::starting_at(((rand::random::<u32>() as u64) << 32) | 1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SessionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a client session needs from its runtime
pub struct SessionContext {
    pub pool: Arc<LinkPool>,
    pub cipher: Arc<dyn FrameCipher>,
    pub plan: ShardPlan,
    pub recovery: RecoveryPolicy,
    pub inbound: Arc<dyn InboundHandshake>,
    pub sessions: Arc<Registry<Session>>,
    pub ids: SessionIds,
}

/// Registered client session
pub struct Session {
    id: u64,
    destination: Address,
    liveness: Liveness,
    downlink: Mutex<BlockInbox>,
    remote_reset: AtomicBool,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn destination(&self) -> &Address {
        &self.destination
    }

    pub fn close(&self) {
        self.liveness.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.liveness.is_cancelled()
    }

    fn new(id: u64, destination: Address, recovery: RecoveryPolicy) -> (Self, UnboundedReceiver<Vec<u8>>) {
        let (inbox, blocks) = BlockInbox::new(recovery);
        let session = Self {
            id,
            destination,
            liveness: Liveness::new(),
            downlink: Mutex::new(inbox),
            remote_reset: AtomicBool::new(false),
        };
        (session, blocks)
    }

    /// Feed one decrypted downlink frame, shard or control.
    pub fn deliver(&self, header: &FrameHeader, payload: Vec<u8>) {
        if self.is_closed() {
            return;
        }
        if header.is_control() {
            self.on_control(&payload);
            return;
        }
        if self.downlink.lock().accept(header, payload) {
            trace!("Session {}: block {} ready", self.id, header.block_id);
        }
    }

    fn on_control(&self, payload: &[u8]) {
        match ControlMessage::decode(payload) {
            Ok(ControlMessage::Close { blocks }) => {
                debug!("Session {}: server closed after {} blocks", self.id, blocks);
                self.downlink.lock().finish_at(blocks);
            }
            Ok(ControlMessage::Reset) => {
                debug!("Session {}: reset by server", self.id);
                self.remote_reset.store(true, Ordering::SeqCst);
                self.close();
            }
            Ok(ControlMessage::Open { .. }) => {
                trace!("Session {}: ignoring downlink open", self.id);
            }
            Err(e) => debug!("Session {}: ignoring control payload: {}", self.id, e),
        }
    }

    /// Drive one accepted local connection to completion.
    pub async fn serve(mut stream: TcpStream, source: Address, ctx: Arc<SessionContext>) -> Result<()> {
        let destination = ctx.inbound.handshake(&mut stream).await?;
        let id = ctx.ids.next_id();
        let start = Instant::now();

        let (session, blocks_rx) = Session::new(id, destination.clone(), ctx.recovery);
        let session = Arc::new(session);
        if !ctx.sessions.insert(id, session.clone()) {
            warn!("Session id {} already in use, dropping {}", id, source);
            return Ok(());
        }
        SESSIONS_OPENED.inc();
        SESSIONS_ACTIVE.inc();
        info!("Session {}: {} -> {}", id, source, destination);

        let result = session.relay(stream, blocks_rx, &ctx).await;

        session.close();
        ctx.sessions.remove_entry(id, &session);
        SESSIONS_ACTIVE.dec();

        let (up, down) = result?;
        info!(
            "Session {} closed: {} (↑{} ↓{} {:?})",
            id,
            destination,
            format_bytes(up),
            format_bytes(down),
            start.elapsed()
        );
        Ok(())
    }

    async fn relay(
        &self,
        stream: TcpStream,
        blocks: UnboundedReceiver<Vec<u8>>,
        ctx: &SessionContext,
    ) -> Result<(u64, u64)> {
        let open = ControlMessage::open(&self.destination);
        self.send_control(ctx, &open).await?;

        let (mut reader, writer) = stream.into_split();
        let downlink = tokio::spawn(write_blocks(writer, blocks, self.liveness.clone()));

        let mut encoder = BlockEncoder::new(self.id, Direction::Uplink, ctx.plan, ctx.cipher.clone());
        let mut buf = vec![0u8; read_size(&ctx.plan)];
        let mut up: u64 = 0;

        let uplink: Result<()> = async {
            while !self.liveness.is_cancelled() {
                let n = tokio::select! {
                    result = reader.read(&mut buf) => match result {
                        Ok(0) => {
                            let close = ControlMessage::Close { blocks: encoder.next_block_id() };
                            debug!("Session {}: local EOF after {} blocks", self.id, encoder.next_block_id());
                            self.send_control(ctx, &close).await?;
                            break;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            debug!("Session {} local read error: {}", self.id, e);
                            self.liveness.cancel();
                            break;
                        }
                    },
                    _ = self.liveness.cancelled() => break,
                };

                for frame in encoder.encode(&buf[..n])? {
                    ctx.pool.send(&frame).await?;
                }
                up += n as u64;
            }
            Ok(())
        }
        .await;
        if uplink.is_err() {
            self.liveness.cancel();
        }

        // The downlink keeps draining after a local half-close
        let down = downlink.await.unwrap_or(0);

        if self.liveness.is_cancelled() && !self.remote_reset.load(Ordering::SeqCst) {
            let _ = self.send_control(ctx, &ControlMessage::Reset).await;
        }
        uplink.map(|_| (up, down))
    }

    async fn send_control(&self, ctx: &SessionContext, message: &ControlMessage) -> Result<()> {
        let frame = control_frame(ctx.cipher.as_ref(), self.id, Direction::Uplink, message)?;
        ctx.pool.send(&frame).await
    }
}

/// Routes downlink frames to their session
impl FrameHandler for Registry<Session> {
    fn on_frame(&self, _link: &Arc<Link>, header: FrameHeader, payload: Vec<u8>) {
        if header.direction() != Some(Direction::Downlink) {
            trace!("Ignoring non-downlink frame for session {}", header.session_id);
            return;
        }
        match self.get(header.session_id) {
            Some(session) => session.deliver(&header, payload),
            None => trace!("No session {} for downlink frame", header.session_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{build_cipher, decode_key, CipherKind, ShardNonce};
    use crate::protocol::Frame;

    fn cipher() -> Arc<dyn FrameCipher> {
        build_cipher(CipherKind::Keystream, &decode_key(None).unwrap())
    }

    fn session(id: u64) -> (Arc<Session>, UnboundedReceiver<Vec<u8>>) {
        let (session, rx) = Session::new(id, Address::domain("example.com", 80), RecoveryPolicy::default());
        (Arc::new(session), rx)
    }

    fn control(cipher: &dyn FrameCipher, id: u64, message: &ControlMessage) -> (FrameHeader, Vec<u8>) {
        let frame = control_frame(cipher, id, Direction::Downlink, message).unwrap();
        let payload = decrypted(&frame, cipher);
        (frame.header, payload)
    }

    fn decrypted(frame: &Frame, cipher: &dyn FrameCipher) -> Vec<u8> {
        let mut payload = frame.payload.to_vec();
        cipher
            .decrypt(&ShardNonce::from_header(&frame.header), &mut payload)
            .unwrap();
        payload
    }

    #[test]
    fn test_session_ids_are_sequential() {
        let ids = SessionIds::starting_at(1);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);

        let random = SessionIds::new();
        assert_eq!(random.next_id() & 0xFFFF_FFFF, 1);
    }

    #[test]
    fn test_deliver_reassembles_downlink() {
        let cipher = cipher();
        let (session, mut rx) = session(42);
        let mut encoder = BlockEncoder::new(42, Direction::Downlink, ShardPlan::new(4, 1, 16, 2), cipher.clone());
        let data: Vec<u8> = (1..=50).collect();

        let mut frames = encoder.encode(&data).unwrap();
        frames.reverse();
        for frame in &frames {
            session.deliver(&frame.header, decrypted(frame, cipher.as_ref()));
        }

        assert_eq!(rx.try_recv().unwrap(), data);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_session_ignores_frames() {
        let cipher = cipher();
        let (session, mut rx) = session(1);
        session.close();

        let mut encoder = BlockEncoder::new(1, Direction::Downlink, ShardPlan::new(1, 0, 8, 1), cipher.clone());
        for frame in encoder.encode(b"late").unwrap() {
            session.deliver(&frame.header, decrypted(&frame, cipher.as_ref()));
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_registry_routes_by_session_id() {
        let cipher = cipher();
        let registry: Registry<Session> = Registry::new();
        let (first, mut first_rx) = session(1);
        let (second, mut second_rx) = session(2);
        registry.insert(1, first);
        registry.insert(2, second);

        let mut encoder = BlockEncoder::new(2, Direction::Downlink, ShardPlan::new(2, 0, 8, 1), cipher.clone());
        let frames = encoder.encode(b"for two").unwrap();

        // No link is needed to route; drive the lookup directly
        for frame in &frames {
            if let Some(session) = registry.get(frame.header.session_id) {
                session.deliver(&frame.header, decrypted(frame, cipher.as_ref()));
            }
        }

        assert_eq!(second_rx.try_recv().unwrap(), b"for two");
        assert!(first_rx.try_recv().is_err());
    }

    #[test]
    fn test_server_close_ends_downlink_after_last_block() {
        let cipher = cipher();
        let (session, mut rx) = session(7);

        let (header, payload) = control(cipher.as_ref(), 7, &ControlMessage::Close { blocks: 1 });
        session.deliver(&header, payload);
        assert!(rx.try_recv().is_err());

        let mut encoder = BlockEncoder::new(7, Direction::Downlink, ShardPlan::new(2, 0, 8, 1), cipher.clone());
        for frame in encoder.encode(b"last words").unwrap() {
            session.deliver(&frame.header, decrypted(&frame, cipher.as_ref()));
        }

        assert_eq!(rx.try_recv().unwrap(), b"last words");
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(!session.is_closed());
    }

    #[test]
    fn test_server_reset_cancels_session() {
        let cipher = cipher();
        let (session, _rx) = session(8);
        let (header, payload) = control(cipher.as_ref(), 8, &ControlMessage::Reset);
        session.deliver(&header, payload);
        assert!(session.is_closed());
        assert!(session.remote_reset.load(Ordering::SeqCst));
    }
}
