//! Error types for Scatter

use thiserror::Error;

/// Main error type for Scatter
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

/// Result type alias for Scatter
pub type Result<T> = std::result::Result<T, Error>;
