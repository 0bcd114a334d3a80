//! Control payloads carried in CONTROL frames
//!
//! ```text
//! SESSION_OPEN: | type (1) | host len (2, BE) | host | port (2, BE) |
//! SESSION_CLOSE: | type (1) | blocks sent (8, BE) |
//! SESSION_RESET: | type (1) |
//! ```
//!
//! CLOSE is a half-close: the sender will send no block at or above `blocks`
//! in its direction. RESET aborts the session in both directions.

use bytes::{Buf, BufMut, BytesMut};

use crate::common::Address;
use crate::error::{Error, Result};

const TYPE_SESSION_OPEN: u8 = 1;
const TYPE_SESSION_CLOSE: u8 = 2;
const TYPE_SESSION_RESET: u8 = 3;

/// Decoded control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Ask the far side to connect to `host:port` for this session
    Open { host: String, port: u16 },
    /// The sender's read side ended after `blocks` blocks
    Close { blocks: u64 },
    /// Abort the session
    Reset,
}

impl ControlMessage {
    pub fn open(destination: &Address) -> Self {
        ControlMessage::Open {
            host: destination.host(),
            port: destination.port(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        match self {
            ControlMessage::Open { host, port } => {
                let len = u16::try_from(host.len()).map_err(|_| {
                    Error::Protocol(format!("Host too long: {} bytes", host.len()))
                })?;
                buf.reserve(1 + 2 + host.len() + 2);
                buf.put_u8(TYPE_SESSION_OPEN);
                buf.put_u16(len);
                buf.extend_from_slice(host.as_bytes());
                buf.put_u16(*port);
            }
            ControlMessage::Close { blocks } => {
                buf.put_u8(TYPE_SESSION_CLOSE);
                buf.put_u64(*blocks);
            }
            ControlMessage::Reset => buf.put_u8(TYPE_SESSION_RESET),
        }
        Ok(buf.to_vec())
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        if !buf.has_remaining() {
            return Err(Error::Protocol("Empty control payload".into()));
        }

        match buf.get_u8() {
            TYPE_SESSION_OPEN => {
                if buf.remaining() < 2 {
                    return Err(Error::Protocol("Truncated SESSION_OPEN".into()));
                }
                let len = buf.get_u16() as usize;
                if buf.remaining() < len + 2 {
                    return Err(Error::Protocol("Truncated SESSION_OPEN".into()));
                }
                let host = String::from_utf8_lossy(&buf[..len]).into_owned();
                buf.advance(len);
                let port = buf.get_u16();
                Ok(ControlMessage::Open { host, port })
            }
            TYPE_SESSION_CLOSE => {
                if buf.remaining() < 8 {
                    return Err(Error::Protocol("Truncated SESSION_CLOSE".into()));
                }
                Ok(ControlMessage::Close { blocks: buf.get_u64() })
            }
            TYPE_SESSION_RESET => Ok(ControlMessage::Reset),
            other => Err(Error::Protocol(format!("Unknown control type: {}", other))),
        }
    }
}
