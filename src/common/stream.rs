//! Stream abstraction used at the local-facing handshake boundary

use tokio::io::{AsyncRead, AsyncWrite};

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

