//! Scatter - a multi-link sharded TCP tunnel
//!
//! # Architecture
//!
//! ```text
//! local app → SOCKS5 (protocol) → Session (app)
//!   → shard + parity (fec) → encrypt (crypto) → frame (protocol)
//!   → LinkPool round robin (transport) → wire
//!   → Dispatcher (app) → BlockReassembler (reassembly) → RemoteConnector → destination
//! ```
//!
//! Responses travel the same path in reverse, sent back on the link that
//! carried the session's open frame.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Address, Liveness, Registry
//! ├── protocol/        # Frame codec, control payload, block framing, SOCKS5
//! ├── crypto/          # Per-frame ciphers (keystream, XChaCha20-Poly1305)
//! ├── fec/             # Shard plan + XOR parity codec
//! ├── reassembly/      # Per-block shard collection
//! ├── transport/       # Links and the client link pool
//! └── app/             # Client runtime/session, server dispatcher/connector
//! ```

// Core types
pub mod common;
pub mod error;

// Wire and data path
pub mod protocol;
pub mod crypto;
pub mod fec;
pub mod reassembly;
pub mod transport;
pub mod app;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{Address, Liveness, Registry};
pub use error::{Error, Result};
pub use config::Config;

pub use app::{ClientRuntime, Dispatcher, RemoteConnector, ServerRuntime, Session};
pub use crypto::{CipherKind, FrameCipher, ShardNonce};
pub use fec::{ShardCodec, ShardPlan};
pub use protocol::{Direction, Frame, FrameHeader, FrameParser};
pub use reassembly::{BlockReassembler, RecoveryPolicy};
pub use transport::{Link, LinkPool};
