//! Common types and abstractions
//!
//! This module defines the core types used throughout the application:
//! - Address: network address representation
//! - Liveness: cancellation shared by the tasks of one proxied stream
//! - Registry: session id keyed table with explicit lifecycle
//! - AsyncReadWrite: type-erased local stream for handshakes
//! - Error: unified error types

mod address;
mod liveness;
mod registry;
mod stream;

pub use address::Address;
pub use liveness::Liveness;
pub use registry::Registry;
pub use stream::AsyncReadWrite;

// Re-export error types from crate root
pub use crate::error::{Error, Result};
