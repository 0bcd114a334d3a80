//! Scatter - multi-link sharded TCP tunnel

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use scatter::app::{ClientRuntime, ServerRuntime};
use scatter::config::{ClientConfig, Config, ServerConfig};
use scatter::crypto::CipherKind;
use scatter::error::{Error, Result};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the SOCKS5 client and its link pool
    Client {
        #[command(flatten)]
        common: CommonArgs,
        /// Local SOCKS5 listen address
        #[arg(long)]
        socks_listen: Option<String>,
        /// Server address <host:port>
        #[arg(long)]
        server: Option<String>,
        /// Number of links to the server
        #[arg(long)]
        pool: Option<usize>,
    },
    /// Run the server dispatcher
    Server {
        #[command(flatten)]
        common: CommonArgs,
        /// Listen address for client links
        #[arg(long)]
        listen: Option<String>,
    },
    /// Print a default configuration
    GenConfig {
        #[arg(value_enum)]
        role: Role,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Role {
    Client,
    Server,
}

/// Flags shared by both roles; they override the config file
#[derive(Args, Debug)]
struct CommonArgs {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Runtime worker threads
    #[arg(long)]
    threads: Option<usize>,
    /// Bytes per shard
    #[arg(long)]
    shard_size: Option<u32>,
    /// Data shards per block
    #[arg(long)]
    shards: Option<u16>,
    /// Parity shards per block (0 or 1)
    #[arg(long)]
    parity: Option<u16>,
    /// Copies sent of every shard
    #[arg(long)]
    copies: Option<u16>,
    /// Pre-shared key, hex encoded
    #[arg(long)]
    key: Option<String>,
    /// Frame cipher: keystream or xchacha20-poly1305
    #[arg(long)]
    cipher: Option<String>,
}

impl CommonArgs {
    fn load(&self, role: Role) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => match role {
                Role::Client => Config::default_client(),
                Role::Server => Config::default_server(),
            },
        };

        if let Some(threads) = self.threads {
            config.worker_threads = Some(threads);
        }
        if let Some(size) = self.shard_size {
            config.shard.shard_size = size;
        }
        if let Some(count) = self.shards {
            config.shard.shard_count = count;
        }
        if let Some(parity) = self.parity {
            config.shard.parity_count = parity;
        }
        if let Some(copies) = self.copies {
            config.shard.copies_per_shard = copies;
        }
        if let Some(key) = &self.key {
            config.crypto.key = key.clone();
        }
        if let Some(name) = &self.cipher {
            config.crypto.cipher = CipherKind::from_str(name)
                .ok_or_else(|| Error::Config(format!("Unknown cipher: {}", name)))?;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, role) = match cli.command {
        Command::GenConfig { role } => {
            let config = match role {
                Role::Client => Config::default_client(),
                Role::Server => Config::default_server(),
            };
            println!("{}", config.to_json()?);
            return Ok(());
        }
        Command::Client {
            common,
            socks_listen,
            server,
            pool,
        } => {
            let mut config = common.load(Role::Client)?;
            let mut client = config.client.take().unwrap_or_else(ClientConfig::default);
            if let Some(listen) = socks_listen {
                client.socks_listen = listen;
            }
            if let Some(server) = server {
                client.server = server;
            }
            if let Some(pool) = pool {
                client.pool_size = pool;
            }
            config.client = Some(client);
            (config, Role::Client)
        }
        Command::Server { common, listen } => {
            let mut config = common.load(Role::Server)?;
            let mut server = config.server.take().unwrap_or_else(ServerConfig::default);
            if let Some(listen) = listen {
                server.listen = listen;
            }
            config.server = Some(server);
            (config, Role::Server)
        }
    };

    init_logging(&config);
    info!("Scatter v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()?;

    rt.block_on(async {
        match role {
            Role::Client => ClientRuntime::bind(&config).await?.run().await,
            Role::Server => ServerRuntime::bind(&config).await?.run().await,
        }
    })?;

    info!("Goodbye!");
    Ok(())
}

/// RUST_LOG wins over the config file's level
fn init_logging(config: &Config) {
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}
