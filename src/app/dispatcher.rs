//! Dispatcher - server-side frame routing
//!
//! Owns the listener for client links and the table of remote connectors.
//!
//! Flow:
//! ```text
//! accept → Link (reader task) → Dispatcher::on_frame
//!            CONTROL/SESSION_OPEN → new RemoteConnector (bound to that link)
//!            DATA/PARITY          → RemoteConnector::deliver
//!            CONTROL/CLOSE, RESET → RemoteConnector::deliver
//! destination done → connector removed, session id tombstoned
//! ```
//!
//! Shards travel on every pool link while the open frame travels on one, so
//! shards may overtake their open. Those are held briefly and replayed when
//! the open arrives. A connector outlives the link that carried its open;
//! only its downlink goes quiet.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};

use crate::common::{Address, Registry, Result};
use crate::crypto::FrameCipher;
use crate::fec::ShardPlan;
use crate::protocol::{ControlMessage, Direction, FrameHeader};
use crate::reassembly::RecoveryPolicy;
use crate::transport::{FrameHandler, Link, LinkOptions};

use super::metrics::{QUEUE_DROPS, SESSIONS_ACTIVE, SESSIONS_OPENED};
use super::remote::RemoteConnector;

/// How long shards for an unopened session are kept
const EARLY_FRAME_TTL: Duration = Duration::from_secs(5);

/// Upper bound on held shards across all sessions
const EARLY_FRAME_LIMIT: usize = 4096;

/// Recently finished session ids remembered so their late traffic is dropped
const CLOSED_SESSION_LIMIT: usize = 4096;

/// Shards that arrived before their session's open frame, and tombstones for
/// sessions that have already ended
#[derive(Default)]
struct EarlyFrames {
    sessions: HashMap<u64, (Instant, Vec<(FrameHeader, Vec<u8>)>)>,
    total: usize,
    closed: HashSet<u64>,
    closed_order: VecDeque<u64>,
}

impl EarlyFrames {
    /// Record a finished session and discard anything held for it.
    fn bury(&mut self, session_id: u64) {
        self.take(session_id);
        if self.closed.insert(session_id) {
            self.closed_order.push_back(session_id);
        }
        while self.closed_order.len() > CLOSED_SESSION_LIMIT {
            if let Some(oldest) = self.closed_order.pop_front() {
                self.closed.remove(&oldest);
            }
        }
    }

    fn is_closed(&self, session_id: u64) -> bool {
        self.closed.contains(&session_id)
    }

    /// Hold a shard. Returns false if the limit is reached.
    fn hold(&mut self, header: FrameHeader, payload: Vec<u8>) -> bool {
        let now = Instant::now();
        if self.total >= EARLY_FRAME_LIMIT {
            self.expire(now);
        }
        if self.total >= EARLY_FRAME_LIMIT {
            return false;
        }
        self.sessions
            .entry(header.session_id)
            .or_insert_with(|| (now, Vec::new()))
            .1
            .push((header, payload));
        self.total += 1;
        true
    }

    fn take(&mut self, session_id: u64) -> Vec<(FrameHeader, Vec<u8>)> {
        match self.sessions.remove(&session_id) {
            Some((_, frames)) => {
                self.total -= frames.len();
                frames
            }
            None => Vec::new(),
        }
    }

    fn expire(&mut self, now: Instant) {
        let mut dropped = 0;
        self.sessions.retain(|_, (since, frames)| {
            let keep = now.duration_since(*since) < EARLY_FRAME_TTL;
            if !keep {
                dropped += frames.len();
            }
            keep
        });
        self.total -= dropped;
    }
}

/// Dispatcher construction parameters
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub listen: Address,
    pub plan: ShardPlan,
    pub recovery: RecoveryPolicy,
    pub link: LinkOptions,
}

/// Server dispatcher
pub struct Dispatcher {
    listener: TcpListener,
    connectors: Arc<Registry<RemoteConnector>>,
    cipher: Arc<dyn FrameCipher>,
    plan: ShardPlan,
    recovery: RecoveryPolicy,
    link_options: LinkOptions,
    link_ids: AtomicU64,
    early: Arc<Mutex<EarlyFrames>>,
}

impl Dispatcher {
    pub async fn bind(config: DispatcherConfig, cipher: Arc<dyn FrameCipher>) -> Result<Arc<Self>> {
        let listener = match &config.listen {
            Address::Socket(addr) => TcpListener::bind(addr).await?,
            Address::Domain(host, port) => TcpListener::bind((host.as_str(), *port)).await?,
        };

        Ok(Arc::new(Self {
            listener,
            connectors: Arc::new(Registry::new()),
            cipher,
            plan: config.plan,
            recovery: config.recovery,
            link_options: config.link,
            link_ids: AtomicU64::new(0),
            early: Arc::new(Mutex::new(EarlyFrames::default())),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn connectors(&self) -> &Arc<Registry<RemoteConnector>> {
        &self.connectors
    }

    /// Accept client links until shutdown.
    pub async fn serve(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("Dispatcher listening on {}", self.local_addr()?);
        let mut links = Vec::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, source)) => {
                            let id = self.link_ids.fetch_add(1, Ordering::Relaxed);
                            let handler: Arc<dyn FrameHandler> = self.clone();
                            match Link::spawn(id, stream, self.link_options, self.cipher.clone(), handler) {
                                Ok(link) => {
                                    debug!("Link {} accepted from {}", id, source);
                                    links.retain(|l: &Arc<Link>| !l.is_closed());
                                    links.push(link);
                                }
                                Err(e) => error!("Link setup for {} failed: {}", source, e),
                            }
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Dispatcher shutting down ({} sessions)", self.connectors.len());
                    break;
                }
            }
        }

        for link in links {
            link.close();
        }
        for connector in self.connectors.drain_where(|_| true) {
            connector.close();
        }
        Ok(())
    }

    fn handle_open(&self, link: &Arc<Link>, session_id: u64, host: String, port: u16) {
        if self.connectors.get(session_id).is_some() {
            debug!("Session {}: duplicate open ignored", session_id);
            return;
        }

        let destination = Address::from_host(&host, port);
        let connector = Arc::new(RemoteConnector::new(session_id, destination.clone(), link, self.recovery));
        let early = {
            let mut held = self.early.lock();
            if held.is_closed(session_id) {
                debug!("Session {}: open for a finished session ignored", session_id);
                return;
            }
            if !self.connectors.insert(session_id, connector.clone()) {
                return;
            }
            held.take(session_id)
        };
        SESSIONS_OPENED.inc();
        SESSIONS_ACTIVE.inc();
        info!("Session {}: open {} via link {}", session_id, destination, link.id());

        if !early.is_empty() {
            trace!("Session {}: replaying {} early frames", session_id, early.len());
        }
        for (header, payload) in early {
            connector.deliver(&header, payload);
        }

        let plan = self.plan;
        let cipher = self.cipher.clone();
        let connectors = self.connectors.clone();
        let tombstones = self.early.clone();
        tokio::spawn(async move {
            connector.run(plan, cipher, connectors).await;
            tombstones.lock().bury(session_id);
        });
    }

    /// Hand a frame to its connector, holding it if the open has not arrived.
    fn route(&self, header: FrameHeader, payload: Vec<u8>) {
        if let Some(connector) = self.connectors.get(header.session_id) {
            connector.deliver(&header, payload);
            return;
        }

        // Recheck under the lock an open holds while inserting
        let mut held = self.early.lock();
        match self.connectors.get(header.session_id) {
            Some(connector) => {
                drop(held);
                connector.deliver(&header, payload);
            }
            None if held.is_closed(header.session_id) => {
                trace!("Dropping frame for finished session {}", header.session_id);
            }
            None => {
                trace!("Holding frame for unopened session {}", header.session_id);
                if !held.hold(header, payload) {
                    QUEUE_DROPS.inc();
                }
            }
        }
    }
}

impl FrameHandler for Dispatcher {
    fn on_frame(&self, link: &Arc<Link>, header: FrameHeader, payload: Vec<u8>) {
        if header.direction() != Some(Direction::Uplink) {
            trace!("Ignoring non-uplink frame for session {}", header.session_id);
            return;
        }
        if header.is_control() {
            match ControlMessage::decode(&payload) {
                Ok(ControlMessage::Open { host, port }) => {
                    self.handle_open(link, header.session_id, host, port);
                }
                Ok(_) => self.route(header, payload),
                Err(e) => debug!("Session {}: ignoring control payload: {}", header.session_id, e),
            }
            return;
        }
        self.route(header, payload);
    }

    fn on_link_closed(&self, link: &Arc<Link>) {
        debug!("Link {} closed, {} sessions active", link.id(), self.connectors.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use crate::crypto::{build_cipher, decode_key, CipherKind, ShardNonce};
    use crate::protocol::{control_frame, BlockEncoder, FrameParser};
    use crate::reassembly::{Assembly, BlockReassembler};

    fn cipher() -> Arc<dyn FrameCipher> {
        build_cipher(CipherKind::Keystream, &decode_key(None).unwrap())
    }

    async fn dispatcher(plan: ShardPlan) -> (Arc<Dispatcher>, broadcast::Sender<()>) {
        let config = DispatcherConfig {
            listen: Address::parse("127.0.0.1:0").unwrap(),
            plan,
            recovery: RecoveryPolicy::RequireAllData,
            link: LinkOptions::default(),
        };
        let dispatcher = Dispatcher::bind(config, cipher()).await.unwrap();
        let (tx, rx) = broadcast::channel(1);
        tokio::spawn(dispatcher.clone().serve(rx));
        (dispatcher, tx)
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_open_data_and_echo_over_raw_link() {
        let plan = ShardPlan::new(4, 1, 16, 2);
        let (dispatcher, _shutdown) = dispatcher(plan).await;
        let echo = echo_server().await;
        let cipher = cipher();

        let mut client = TcpStream::connect(dispatcher.local_addr().unwrap()).await.unwrap();
        let open = control_frame(cipher.as_ref(), 77, Direction::Uplink, &ControlMessage::open(&Address::from(echo))).unwrap();
        client.write_all(&open.to_bytes()).await.unwrap();

        let data: Vec<u8> = (1..=50).collect();
        let mut encoder = BlockEncoder::new(77, Direction::Uplink, plan, cipher.clone());
        let mut frames = encoder.encode(&data).unwrap();
        assert_eq!(frames.len(), 10);
        frames.reverse();
        for frame in &frames {
            client.write_all(&frame.to_bytes()).await.unwrap();
        }

        // Echoed bytes come back as downlink shards on the same socket
        let mut parser = FrameParser::new();
        let mut reassembler = BlockReassembler::default();
        let mut echoed = Vec::new();
        let mut buf = [0u8; 4096];
        while echoed.len() < data.len() {
            let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0);
            parser.extend(&buf[..n]);
            while let Some(frame) = parser.next_frame() {
                assert_eq!(frame.header.session_id, 77);
                assert_eq!(frame.header.direction(), Some(Direction::Downlink));
                let mut payload = frame.payload.to_vec();
                cipher
                    .decrypt(&ShardNonce::from_header(&frame.header), &mut payload)
                    .unwrap();
                if let Assembly::Complete(block) = reassembler.accept(&frame.header, payload) {
                    echoed.extend(block);
                }
            }
        }
        assert_eq!(echoed, data);
        assert_eq!(dispatcher.connectors().len(), 1);

        // Closing the uplink ends the echo, whose EOF comes back as a close
        let close = control_frame(cipher.as_ref(), 77, Direction::Uplink, &ControlMessage::Close { blocks: 1 }).unwrap();
        client.write_all(&close.to_bytes()).await.unwrap();
        let closed = 'read: loop {
            while let Some(frame) = parser.next_frame() {
                if frame.header.is_control() {
                    break 'read frame;
                }
            }
            let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0);
            parser.extend(&buf[..n]);
        };
        let mut payload = closed.payload.to_vec();
        cipher
            .decrypt(&ShardNonce::from_header(&closed.header), &mut payload)
            .unwrap();
        assert!(matches!(ControlMessage::decode(&payload).unwrap(), ControlMessage::Close { .. }));
        wait_for(|| dispatcher.connectors().is_empty()).await;
    }

    #[tokio::test]
    async fn test_malformed_control_and_unknown_session_ignored() {
        let (dispatcher, _shutdown) = dispatcher(ShardPlan::new(2, 0, 8, 1)).await;
        let cipher = cipher();
        let mut client = TcpStream::connect(dispatcher.local_addr().unwrap()).await.unwrap();

        // Control frame with a truncated payload
        let mut bogus = vec![1u8, 0, 40];
        let header = FrameHeader::new(crate::protocol::flags::CONTROL, Direction::Uplink, 5, 0);
        cipher.encrypt(&ShardNonce::from_header(&header), &mut bogus).unwrap();
        client
            .write_all(&crate::protocol::Frame::new(header, bogus).to_bytes())
            .await
            .unwrap();

        // Data for a session that was never opened
        let mut encoder = BlockEncoder::new(6, Direction::Uplink, ShardPlan::new(2, 0, 8, 1), cipher.clone());
        for frame in encoder.encode(b"orphan").unwrap() {
            client.write_all(&frame.to_bytes()).await.unwrap();
        }

        // Close for a session that was never opened
        let close = control_frame(cipher.as_ref(), 5, Direction::Uplink, &ControlMessage::Close { blocks: 0 }).unwrap();
        client.write_all(&close.to_bytes()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(dispatcher.connectors().is_empty());
    }

    #[test]
    fn test_early_frames_held_and_taken() {
        let mut early = EarlyFrames::default();
        for block in 0..3 {
            let header = FrameHeader::new(crate::protocol::flags::DATA, Direction::Uplink, 4, block);
            assert!(early.hold(header, vec![1]));
        }
        let header = FrameHeader::new(crate::protocol::flags::DATA, Direction::Uplink, 8, 0);
        assert!(early.hold(header, vec![2]));

        let taken = early.take(4);
        assert_eq!(taken.len(), 3);
        assert_eq!(taken[2].0.block_id, 2);
        assert_eq!(early.total, 1);
        assert!(early.take(4).is_empty());
    }

    #[test]
    fn test_early_frames_bounded() {
        let mut early = EarlyFrames::default();
        let header = FrameHeader::new(crate::protocol::flags::DATA, Direction::Uplink, 1, 0);
        for _ in 0..EARLY_FRAME_LIMIT {
            assert!(early.hold(header, Vec::new()));
        }
        assert!(!early.hold(header, Vec::new()));

        early.expire(Instant::now() + EARLY_FRAME_TTL);
        assert_eq!(early.total, 0);
        assert!(early.hold(header, Vec::new()));
    }

    #[tokio::test]
    async fn test_shards_before_open_are_replayed() {
        let plan = ShardPlan::new(2, 0, 8, 1);
        let (dispatcher, _shutdown) = dispatcher(plan).await;
        let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cipher = cipher();
        let mut client = TcpStream::connect(dispatcher.local_addr().unwrap()).await.unwrap();

        let mut encoder = BlockEncoder::new(21, Direction::Uplink, plan, cipher.clone());
        for frame in encoder.encode(b"early bird").unwrap() {
            client.write_all(&frame.to_bytes()).await.unwrap();
        }
        let open = control_frame(
            cipher.as_ref(),
            21,
            Direction::Uplink,
            &ControlMessage::open(&Address::from(destination.local_addr().unwrap())),
        )
        .unwrap();
        client.write_all(&open.to_bytes()).await.unwrap();

        let (mut remote, _) = tokio::time::timeout(Duration::from_secs(2), destination.accept())
            .await
            .unwrap()
            .unwrap();
        let mut received = [0u8; 10];
        tokio::time::timeout(Duration::from_secs(2), remote.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, b"early bird");
    }

    #[tokio::test]
    async fn test_duplicate_open_keeps_first_connector() {
        let (dispatcher, _shutdown) = dispatcher(ShardPlan::new(2, 0, 8, 1)).await;
        let echo = echo_server().await;
        let cipher = cipher();
        let mut client = TcpStream::connect(dispatcher.local_addr().unwrap()).await.unwrap();

        let open = control_frame(cipher.as_ref(), 11, Direction::Uplink, &ControlMessage::open(&Address::from(echo))).unwrap();
        client.write_all(&open.to_bytes()).await.unwrap();
        wait_for(|| dispatcher.connectors().len() == 1).await;
        let first = dispatcher.connectors().get(11).unwrap();

        client.write_all(&open.to_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(Arc::ptr_eq(&first, &dispatcher.connectors().get(11).unwrap()));
    }

    async fn open_session(client: &mut TcpStream, session_id: u64, destination: &TcpListener) -> TcpStream {
        let open = control_frame(
            cipher().as_ref(),
            session_id,
            Direction::Uplink,
            &ControlMessage::open(&Address::from(destination.local_addr().unwrap())),
        )
        .unwrap();
        client.write_all(&open.to_bytes()).await.unwrap();
        let (remote, _) = tokio::time::timeout(Duration::from_secs(2), destination.accept())
            .await
            .unwrap()
            .unwrap();
        remote
    }

    #[tokio::test]
    async fn test_uplink_survives_open_link_death() {
        let plan = ShardPlan::new(2, 0, 16, 1);
        let (dispatcher, _shutdown) = dispatcher(plan).await;
        let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cipher = cipher();
        let addr = dispatcher.local_addr().unwrap();

        let mut link_a = TcpStream::connect(addr).await.unwrap();
        let mut link_b = TcpStream::connect(addr).await.unwrap();
        let mut remote = open_session(&mut link_a, 31, &destination).await;

        drop(link_a);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.connectors().len(), 1);

        let mut encoder = BlockEncoder::new(31, Direction::Uplink, plan, cipher.clone());
        for frame in encoder.encode(b"via link B").unwrap() {
            link_b.write_all(&frame.to_bytes()).await.unwrap();
        }

        let mut received = [0u8; 10];
        tokio::time::timeout(Duration::from_secs(2), remote.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, b"via link B");

        // Downlink has nowhere to go but the destination is still read
        remote.write_all(b"unheard").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.connectors().len(), 1);
    }

    #[test]
    fn test_buried_sessions_drop_held_frames() {
        let mut early = EarlyFrames::default();
        let header = FrameHeader::new(crate::protocol::flags::DATA, Direction::Uplink, 3, 0);
        assert!(early.hold(header, vec![1]));

        early.bury(3);
        assert!(early.is_closed(3));
        assert_eq!(early.total, 0);

        for id in 100..100 + CLOSED_SESSION_LIMIT as u64 {
            early.bury(id);
        }
        assert!(!early.is_closed(3));
        assert!(early.is_closed(100));
        assert_eq!(early.closed.len(), CLOSED_SESSION_LIMIT);
    }

    #[tokio::test]
    async fn test_finished_session_traffic_does_not_starve_new_sessions() {
        let plan = ShardPlan::new(2, 0, 8, 1);
        let (dispatcher, _shutdown) = dispatcher(plan).await;
        let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cipher = cipher();
        let mut client = TcpStream::connect(dispatcher.local_addr().unwrap()).await.unwrap();

        // Session 41 runs to completion in both directions
        let remote = open_session(&mut client, 41, &destination).await;
        let close = control_frame(cipher.as_ref(), 41, Direction::Uplink, &ControlMessage::Close { blocks: 0 }).unwrap();
        client.write_all(&close.to_bytes()).await.unwrap();
        drop(remote);
        wait_for(|| dispatcher.early.lock().is_closed(41)).await;
        assert!(dispatcher.connectors().is_empty());

        // The client keeps streaming for it, well past the hold budget
        let mut encoder = BlockEncoder::new(41, Direction::Uplink, plan, cipher.clone());
        let mut flood = Vec::new();
        for _ in 0..EARLY_FRAME_LIMIT {
            for frame in encoder.encode(b"stale").unwrap() {
                flood.extend_from_slice(&frame.to_bytes());
            }
        }
        client.write_all(&flood).await.unwrap();

        // A new session's shards overtake its open and must still be held
        let mut encoder = BlockEncoder::new(42, Direction::Uplink, plan, cipher.clone());
        for frame in encoder.encode(b"fresh").unwrap() {
            client.write_all(&frame.to_bytes()).await.unwrap();
        }
        let mut remote = open_session(&mut client, 42, &destination).await;

        let mut received = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(2), remote.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, b"fresh");
        assert_eq!(dispatcher.early.lock().total, 0);
    }
}
