//! Frame codec
//!
//! Wire layout of the 40-byte header (multi-byte fields little-endian):
//!
//! ```text
//!  0       4   5   6   7   8               16              24  26  28  30  32      36      40
//!  +-------+---+---+---+---+---------------+---------------+---+---+---+---+-------+-------+
//!  | magic |ver|flg|dir|rsv|  session id   |   block id    |sid|cnt|par|cpy|  len  | crc32 |
//!  +-------+---+---+---+---+---------------+---------------+---+---+---+---+-------+-------+
//! ```
//!
//! The checksum covers the first 36 bytes. A receiver only trusts a header
//! whose magic, version and checksum all validate; anything else advances the
//! parse cursor by one byte (resynchronization).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{Error, Result};

/// 'SCTR'
pub const MAGIC: u32 = 0x5343_5452;

pub const VERSION: u8 = 1;

pub const HEADER_LEN: usize = 40;

/// Bytes covered by the header checksum
const CHECKSUM_SPAN: usize = HEADER_LEN - 4;

/// Upper bound on a declared payload length. Larger values are treated as a
/// corrupt header.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Frame flag bits
pub mod flags {
    pub const DATA: u8 = 0x01;
    pub const CONTROL: u8 = 0x02;
    pub const PARITY: u8 = 0x04;
    pub const DUPLICATE: u8 = 0x08;
}

/// Direction of travel, part of every cipher nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    /// client → destination
    Uplink = 0,
    /// destination → client
    Downlink = 1,
}

impl Direction {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Direction::Uplink),
            1 => Some(Direction::Downlink),
            _ => None,
        }
    }
}

/// CRC32 (IEEE) over header bytes
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Fixed-width frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: u8,
    /// Raw direction byte. Kept raw so a header round-trips bit-exactly;
    /// use [`FrameHeader::direction`] for the typed value.
    pub direction: u8,
    pub session_id: u64,
    pub block_id: u64,
    pub shard_id: u16,
    pub shard_count: u16,
    pub parity_count: u16,
    pub copy_seq: u16,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn new(flags: u8, direction: Direction, session_id: u64, block_id: u64) -> Self {
        Self {
            flags,
            direction: direction.as_u8(),
            session_id,
            block_id,
            shard_id: 0,
            shard_count: 0,
            parity_count: 0,
            copy_seq: 0,
            payload_len: 0,
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        Direction::from_u8(self.direction)
    }

    pub fn is_data(&self) -> bool {
        self.flags & flags::DATA != 0
    }

    pub fn is_control(&self) -> bool {
        self.flags & flags::CONTROL != 0
    }

    pub fn is_parity(&self) -> bool {
        self.flags & flags::PARITY != 0
    }

    pub fn is_duplicate(&self) -> bool {
        self.flags & flags::DUPLICATE != 0
    }

    /// Serialize to exactly [`HEADER_LEN`] bytes, computing the checksum.
    pub fn encode(&self, dst: &mut BytesMut) {
        let start = dst.len();
        dst.reserve(HEADER_LEN);
        dst.put_u32_le(MAGIC);
        dst.put_u8(VERSION);
        dst.put_u8(self.flags);
        dst.put_u8(self.direction);
        dst.put_u8(0);
        dst.put_u64_le(self.session_id);
        dst.put_u64_le(self.block_id);
        dst.put_u16_le(self.shard_id);
        dst.put_u16_le(self.shard_count);
        dst.put_u16_le(self.parity_count);
        dst.put_u16_le(self.copy_seq);
        dst.put_u32_le(self.payload_len);
        let crc = checksum(&dst[start..start + CHECKSUM_SPAN]);
        dst.put_u32_le(crc);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        self.encode(&mut buf);
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Parse and validate a header from the first [`HEADER_LEN`] bytes of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_LEN {
            return Err(Error::Protocol(format!(
                "Header too short: {} bytes",
                src.len()
            )));
        }

        let mut buf = &src[..HEADER_LEN];
        let magic = buf.get_u32_le();
        if magic != MAGIC {
            return Err(Error::Protocol(format!("Bad magic: {:#010x}", magic)));
        }
        let version = buf.get_u8();
        if version != VERSION {
            return Err(Error::Protocol(format!("Unsupported version: {}", version)));
        }
        let flags = buf.get_u8();
        let direction = buf.get_u8();
        let _reserved = buf.get_u8();
        let session_id = buf.get_u64_le();
        let block_id = buf.get_u64_le();
        let shard_id = buf.get_u16_le();
        let shard_count = buf.get_u16_le();
        let parity_count = buf.get_u16_le();
        let copy_seq = buf.get_u16_le();
        let payload_len = buf.get_u32_le();
        let crc = buf.get_u32_le();

        let expected = checksum(&src[..CHECKSUM_SPAN]);
        if crc != expected {
            return Err(Error::Protocol(format!(
                "Header checksum mismatch: got {:#010x}, expected {:#010x}",
                crc, expected
            )));
        }
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::Protocol(format!(
                "Payload length {} exceeds limit",
                payload_len
            )));
        }

        Ok(Self {
            flags,
            direction,
            session_id,
            block_id,
            shard_id,
            shard_count,
            parity_count,
            copy_seq,
            payload_len,
        })
    }
}

/// Header plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame, fixing up `payload_len` from the payload.
    pub fn new(mut header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        header.payload_len = payload.len() as u32;
        Self { header, payload }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Serialize header and payload into one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Incremental frame parser over a growing byte accumulator
///
/// Feed it whatever a socket read returned; it yields every complete frame
/// and keeps the tail buffered until more bytes arrive.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: BytesMut,
    skipped: u64,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes discarded while resynchronizing
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Take the next complete frame, if any.
    ///
    /// Invalid header candidates are skipped one byte at a time. A valid header
    /// whose payload is not fully buffered stops parsing without consuming
    /// anything.
    pub fn next_frame(&mut self) -> Option<Frame> {
        while self.buf.len() >= HEADER_LEN {
            let header = match FrameHeader::decode(&self.buf[..HEADER_LEN]) {
                Ok(header) => header,
                Err(e) => {
                    trace!("Resync: {}", e);
                    self.buf.advance(1);
                    self.skipped += 1;
                    continue;
                }
            };

            let needed = HEADER_LEN + header.payload_len as usize;
            if self.buf.len() < needed {
                return None;
            }

            let mut frame = self.buf.split_to(needed);
            frame.advance(HEADER_LEN);
            return Some(Frame {
                header,
                payload: frame.freeze(),
            });
        }
        None
    }
}
