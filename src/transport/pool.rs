//! Link pool
//!
//! N persistent links to one server. Frames are spread over the slots by an
//! atomic round-robin counter. Each slot has a supervisor task that connects,
//! waits for the link to die and reconnects after a fixed delay, forever.
//! Frames queued on a link when it dies are lost; they are not moved to
//! another slot.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::app::metrics::{LINK_RECONNECTS, QUEUE_DROPS};
use crate::common::{Address, Liveness, Result};
use crate::crypto::FrameCipher;
use crate::error::Error;
use crate::protocol::Frame;

use super::link::{Link, LinkOptions};
use super::FrameHandler;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub server: Address,
    pub size: usize,
    pub reconnect_delay: Duration,
    pub link: LinkOptions,
}

/// Round-robin pool of links
pub struct LinkPool {
    slots: Vec<Mutex<Option<Arc<Link>>>>,
    next: AtomicUsize,
    link_ids: AtomicU64,
    shutdown: Liveness,
}

impl LinkPool {
    /// Create the pool and start one supervisor per slot.
    pub fn connect(
        config: PoolConfig,
        cipher: Arc<dyn FrameCipher>,
        handler: Arc<dyn FrameHandler>,
    ) -> Arc<Self> {
        let size = config.size.max(1);
        let pool = Arc::new(Self {
            slots: (0..size).map(|_| Mutex::new(None)).collect(),
            next: AtomicUsize::new(0),
            link_ids: AtomicU64::new(0),
            shutdown: Liveness::new(),
        });

        for slot in 0..size {
            let pool = pool.clone();
            let config = config.clone();
            let cipher = cipher.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                pool.supervise(slot, config, cipher, handler).await;
            });
        }

        info!("Link pool: {} links to {}", size, config.server);
        pool
    }

    /// Build a pool over already connected links, without supervisors.
    pub fn from_links(links: Vec<Arc<Link>>) -> Arc<Self> {
        let next_id = links.iter().map(|l| l.id() + 1).max().unwrap_or(0);
        Arc::new(Self {
            slots: links.into_iter().map(|l| Mutex::new(Some(l))).collect(),
            next: AtomicUsize::new(0),
            link_ids: AtomicU64::new(next_id),
            shutdown: Liveness::new(),
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots with a live link
    pub fn connected(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().as_ref().is_some_and(|l| !l.is_closed()))
            .count()
    }

    pub fn link(&self, slot: usize) -> Option<Arc<Link>> {
        self.slots.get(slot).and_then(|s| s.lock().clone())
    }

    /// Send one frame on the next slot in round-robin order.
    ///
    /// A slot that is down loses the frame; duplication across slots is what
    /// covers for it.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        if self.slots.is_empty() {
            return Err(Error::Transport("Link pool has no slots".into()));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let link = self.slots[index].lock().clone();

        match link {
            Some(link) => {
                if let Err(e) = link.send(frame).await {
                    QUEUE_DROPS.inc();
                    trace!("Slot {} send failed: {}", index, e);
                }
            }
            None => {
                QUEUE_DROPS.inc();
                trace!("Slot {} not connected, frame dropped", index);
            }
        }
        Ok(())
    }

    /// Close every link and stop reconnecting.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for slot in &self.slots {
            if let Some(link) = slot.lock().take() {
                link.close();
            }
        }
    }

    async fn supervise(
        self: Arc<Self>,
        slot: usize,
        config: PoolConfig,
        cipher: Arc<dyn FrameCipher>,
        handler: Arc<dyn FrameHandler>,
    ) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match config.server.connect().await {
                Ok(stream) => {
                    let id = self.link_ids.fetch_add(1, Ordering::Relaxed);
                    match Link::spawn(id, stream, config.link, cipher.clone(), handler.clone()) {
                        Ok(link) => {
                            debug!("Slot {} connected as link {}", slot, id);
                            *self.slots[slot].lock() = Some(link.clone());

                            tokio::select! {
                                _ = link.closed() => {}
                                _ = self.shutdown.cancelled() => {
                                    link.close();
                                    break;
                                }
                            }

                            {
                                let mut current = self.slots[slot].lock();
                                if current.as_ref().is_some_and(|l| Arc::ptr_eq(l, &link)) {
                                    *current = None;
                                }
                            }
                            warn!(
                                "Slot {} link {} lost, reconnecting in {:?}",
                                slot, id, config.reconnect_delay
                            );
                        }
                        Err(e) => warn!("Slot {} link setup failed: {}", slot, e),
                    }
                }
                Err(e) => {
                    warn!("Slot {} connect to {} failed: {}", slot, config.server, e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(config.reconnect_delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
            LINK_RECONNECTS.inc();
        }
        debug!("Slot {} supervisor stopped", slot);
    }
}
