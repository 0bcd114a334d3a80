//! Runtime - configuration-driven client and server assembly
//!
//! The runtime is responsible for:
//! - Turning a [`Config`] into listeners, pools and ciphers
//! - Accepting local SOCKS5 connections (client)
//! - Running the dispatcher (server)
//! - Periodic statistics and Ctrl+C shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::common::{Address, Registry, Result};
use crate::config::Config;
use crate::crypto::{build_cipher, FrameCipher};
use crate::protocol::{InboundHandshake, Socks5Inbound};
use crate::transport::{FrameHandler, LinkPool, PoolConfig};

use super::dispatcher::{Dispatcher, DispatcherConfig};
use super::metrics;
use super::session::{Session, SessionContext, SessionIds};

/// Interval between statistics log lines
const STATS_INTERVAL: Duration = Duration::from_secs(60);

fn cipher_from(config: &Config) -> Result<Arc<dyn FrameCipher>> {
    let key = config.crypto.key_bytes()?;
    Ok(build_cipher(config.crypto.cipher, &key))
}

/// Client runtime: SOCKS5 listener in front of a link pool
pub struct ClientRuntime {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ClientRuntime {
    /// Bind the SOCKS5 listener and start connecting the link pool.
    pub async fn bind(config: &Config) -> Result<Self> {
        config.validate()?;
        metrics::init_metrics();

        let client = config.client_or_default();
        let cipher = cipher_from(config)?;
        let plan = config.shard.plan();

        let sessions: Arc<Registry<Session>> = Arc::new(Registry::new());
        let handler: Arc<dyn FrameHandler> = sessions.clone();
        let pool = LinkPool::connect(
            PoolConfig {
                server: Address::parse(&client.server)?,
                size: client.pool_size,
                reconnect_delay: Duration::from_millis(client.reconnect_delay_ms),
                link: client.link_options(),
            },
            cipher.clone(),
            handler,
        );

        let listen = Address::parse(&client.socks_listen)?;
        let listener = match &listen {
            Address::Socket(addr) => TcpListener::bind(addr).await?,
            Address::Domain(host, port) => TcpListener::bind((host.as_str(), *port)).await?,
        };

        let inbound: Arc<dyn InboundHandshake> = Arc::new(Socks5Inbound::new());
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            listener,
            ctx: Arc::new(SessionContext {
                pool,
                cipher,
                plan,
                recovery: config.shard.recovery,
                inbound,
                sessions,
                ids: SessionIds::new(),
            }),
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn sessions(&self) -> &Arc<Registry<Session>> {
        &self.ctx.sessions
    }

    pub fn pool(&self) -> &Arc<LinkPool> {
        &self.ctx.pool
    }

    /// Stop accepting, close every session and the pool.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Accept local connections until shutdown.
    pub async fn serve(&self) -> Result<()> {
        self.serve_until(self.shutdown_tx.subscribe()).await
    }

    async fn serve_until(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(
            "[{}] Listening on {}",
            self.ctx.inbound.name(),
            self.local_addr()?
        );

        let mut conn_count: u64 = 0;
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, source)) => {
                            conn_count += 1;
                            let conn_id = conn_count;
                            debug!("New connection #{} from {}", conn_id, source);

                            let _ = stream.set_nodelay(true);
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Session::serve(stream, Address::from(source), ctx).await {
                                    warn!("Connection #{} from {} error: {}", conn_id, source, e);
                                }
                            });
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down (handled {} connections)", conn_count);
                    break;
                }
            }
        }

        for session in self.ctx.sessions.drain_where(|_| true) {
            session.close();
        }
        self.ctx.pool.shutdown();
        Ok(())
    }

    /// Serve until Ctrl+C.
    pub async fn run(&self) -> Result<()> {
        let stats = tokio::spawn(stats_reporter(self.shutdown_tx.subscribe()));
        let serve = self.serve_until(self.shutdown_tx.subscribe());
        tokio::pin!(serve);

        tokio::select! {
            result = &mut serve => result?,
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutting down...");
                self.shutdown();
                serve.await?;
            }
        }

        let _ = stats.await;
        log_final_stats();
        Ok(())
    }
}

/// Server runtime: the dispatcher plus lifecycle
pub struct ServerRuntime {
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ServerRuntime {
    pub async fn bind(config: &Config) -> Result<Self> {
        config.validate()?;
        metrics::init_metrics();

        let server = config.server_or_default();
        let dispatcher = Dispatcher::bind(
            DispatcherConfig {
                listen: Address::parse(&server.listen)?,
                plan: config.shard.plan(),
                recovery: config.shard.recovery,
                link: server.link_options(),
            },
            cipher_from(config)?,
        )
        .await?;

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            dispatcher,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.dispatcher.local_addr()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Accept client links until shutdown.
    pub async fn serve(&self) -> Result<()> {
        self.dispatcher
            .clone()
            .serve(self.shutdown_tx.subscribe())
            .await
    }

    /// Serve until Ctrl+C.
    pub async fn run(&self) -> Result<()> {
        let stats = tokio::spawn(stats_reporter(self.shutdown_tx.subscribe()));
        let serve = tokio::spawn(
            self.dispatcher
                .clone()
                .serve(self.shutdown_tx.subscribe()),
        );

        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");
        self.shutdown();

        match serve.await {
            Ok(result) => result?,
            Err(e) => error!("Dispatcher task failed: {}", e),
        }
        let _ = stats.await;
        log_final_stats();
        Ok(())
    }
}

/// Stats reporter task - logs a summary every interval
async fn stats_reporter(mut shutdown_rx: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // first tick fires immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                info!("Stats: {}", metrics::summary());
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
}

fn log_final_stats() {
    info!("Final stats: {}", metrics::summary());
    debug!("Metrics:\n{}", metrics::gather_text());
}
