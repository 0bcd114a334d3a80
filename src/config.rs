//! Configuration module for Scatter
//!
//! One JSON file describes either end. Shard and crypto settings must match
//! on client and server.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::common::Address;
use crate::crypto::{decode_key, CipherKind, DEFAULT_KEY_HEX};
use crate::error::{Error, Result};
use crate::fec::ShardPlan;
use crate::reassembly::RecoveryPolicy;
use crate::transport::{LinkOptions, QueuePolicy};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Runtime worker threads; defaults to the CPU count (at least 2)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_threads: Option<usize>,

    /// Sharding and duplication
    #[serde(default)]
    pub shard: ShardSettings,

    /// Frame encryption
    #[serde(default)]
    pub crypto: CryptoSettings,

    /// Client role settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,

    /// Server role settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Serialize as pretty JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Create a default client configuration
    pub fn default_client() -> Self {
        Config {
            log: LogConfig::default(),
            worker_threads: None,
            shard: ShardSettings::default(),
            crypto: CryptoSettings::default(),
            client: Some(ClientConfig::default()),
            server: None,
        }
    }

    /// Create a default server configuration
    pub fn default_server() -> Self {
        Config {
            log: LogConfig::default(),
            worker_threads: None,
            shard: ShardSettings::default(),
            crypto: CryptoSettings::default(),
            client: None,
            server: Some(ServerConfig::default()),
        }
    }

    /// Client section, or its defaults when absent
    pub fn client_or_default(&self) -> ClientConfig {
        self.client.clone().unwrap_or_default()
    }

    /// Server section, or its defaults when absent
    pub fn server_or_default(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .max(2)
        })
    }

    /// Reject settings the data path cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.shard.validate()?;
        self.crypto.key_bytes()?;

        if self.worker_threads == Some(0) {
            return Err(Error::Config("worker_threads must be at least 1".into()));
        }

        if let Some(client) = &self.client {
            if client.pool_size == 0 {
                return Err(Error::Config("pool_size must be at least 1".into()));
            }
            if client.queue_capacity == 0 {
                return Err(Error::Config("queue_capacity must be at least 1".into()));
            }
            Address::parse(&client.socks_listen)?;
            Address::parse(&client.server)?;
        }

        if let Some(server) = &self.server {
            if server.queue_capacity == 0 {
                return Err(Error::Config("queue_capacity must be at least 1".into()));
            }
            Address::parse(&server.listen)?;
        }

        Ok(())
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Shard plan as configured
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSettings {
    #[serde(default = "default_shard_size")]
    pub shard_size: u32,

    #[serde(default = "default_shard_count")]
    pub shard_count: u16,

    /// 0 disables parity; anything above 1 still yields one XOR shard
    #[serde(default = "default_parity_count")]
    pub parity_count: u16,

    #[serde(default = "default_copies_per_shard")]
    pub copies_per_shard: u16,

    /// What the receiver does with parity shards
    #[serde(default)]
    pub recovery: RecoveryPolicy,
}

fn default_shard_size() -> u32 {
    1400
}

fn default_shard_count() -> u16 {
    8
}

fn default_parity_count() -> u16 {
    1
}

fn default_copies_per_shard() -> u16 {
    2
}

impl Default for ShardSettings {
    fn default() -> Self {
        Self {
            shard_size: default_shard_size(),
            shard_count: default_shard_count(),
            parity_count: default_parity_count(),
            copies_per_shard: default_copies_per_shard(),
            recovery: RecoveryPolicy::default(),
        }
    }
}

impl ShardSettings {
    pub fn plan(&self) -> ShardPlan {
        ShardPlan::new(
            self.shard_count,
            self.parity_count.min(1),
            self.shard_size,
            self.copies_per_shard,
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(Error::Config("shard_count must be at least 1".into()));
        }
        if self.shard_size == 0 {
            return Err(Error::Config("shard_size must be at least 1".into()));
        }
        if self.copies_per_shard == 0 {
            return Err(Error::Config("copies_per_shard must be at least 1".into()));
        }
        if self.shard_count as u32 + self.parity_count.min(1) as u32 >= u16::MAX as u32 {
            return Err(Error::Config("shard_count too large for 16-bit shard ids".into()));
        }
        if self.shard_size > crate::protocol::MAX_PAYLOAD_LEN / 2 {
            return Err(Error::Config(format!(
                "shard_size {} exceeds the frame payload limit",
                self.shard_size
            )));
        }
        if self.recovery == RecoveryPolicy::ParityRecovery && self.parity_count == 0 {
            return Err(Error::Config(
                "parity-recovery needs parity_count of at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Cipher selection and pre-shared key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoSettings {
    #[serde(default)]
    pub cipher: CipherKind,

    /// Hex-encoded pre-shared key
    #[serde(default = "default_key")]
    pub key: String,
}

fn default_key() -> String {
    DEFAULT_KEY_HEX.to_string()
}

impl Default for CryptoSettings {
    fn default() -> Self {
        Self {
            cipher: CipherKind::default(),
            key: default_key(),
        }
    }
}

impl CryptoSettings {
    pub fn key_bytes(&self) -> Result<Vec<u8>> {
        decode_key(Some(&self.key))
    }
}

/// Client role settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local SOCKS5 listen address
    #[serde(default = "default_socks_listen")]
    pub socks_listen: String,

    /// Server address (host:port)
    #[serde(default = "default_server_addr")]
    pub server: String,

    /// Number of links kept open to the server
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Delay before a failed link is reconnected
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Frames each link may queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Behaviour on a full link queue
    #[serde(default)]
    pub queue_policy: QueuePolicy,
}

fn default_socks_listen() -> String {
    "127.0.0.1:1080".to_string()
}

fn default_server_addr() -> String {
    "127.0.0.1:46080".to_string()
}

fn default_pool_size() -> usize {
    8
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    4096
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socks_listen: default_socks_listen(),
            server: default_server_addr(),
            pool_size: default_pool_size(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            queue_capacity: default_queue_capacity(),
            queue_policy: QueuePolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            queue_capacity: self.queue_capacity,
            queue_policy: self.queue_policy,
        }
    }
}

/// Server role settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for client links
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Frames each inbound link may queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_listen() -> String {
    "0.0.0.0:46080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl ServerConfig {
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            queue_capacity: self.queue_capacity,
            queue_policy: QueuePolicy::Block,
        }
    }
}
