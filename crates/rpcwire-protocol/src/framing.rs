//! Length-prefixed framing of the TCP byte stream.
//!
//! Every frame starts with a big-endian header holding the frame's *total*
//! length (header included):
//!
//! ```text
//! +----------------------+------------------+
//! | total (N bytes, BE)  |  payload         |
//! +----------------------+------------------+
//! ```
//!
//! `N` is the smallest number of bytes able to represent the configured
//! maximum packet size, so a 65 535-byte limit gives a two-byte header.

use bytes::{Bytes, BytesMut};
use rpcwire_core::{BinaryReader, BinaryWriter, Endian, width_for};

use crate::error::{ProtocolError, ProtocolResult};

/// Stateful frame encoder/decoder bound to one connection.
///
/// ```rust
/// use rpcwire_protocol::FrameCodec;
///
/// let mut codec = FrameCodec::new(65_535).unwrap();
/// let frame = codec.encode(b"ping").unwrap();
/// assert_eq!(&frame[..2], &[0, 6]);
///
/// codec.feed(&frame[..3]);
/// assert!(codec.try_take_frame().unwrap().is_none());
/// codec.feed(&frame[3..]);
/// assert_eq!(&codec.try_take_frame().unwrap().unwrap()[..], b"ping");
/// ```
#[derive(Debug)]
pub struct FrameCodec {
    header_width: usize,
    max_packet_size: u64,
    buffer: BytesMut,
}

impl FrameCodec {
    /// Creates a codec for the given maximum packet size.
    pub fn new(max_packet_size: u64) -> ProtocolResult<Self> {
        let header_width = width_for(max_packet_size);
        if max_packet_size <= header_width as u64 {
            return Err(ProtocolError::InvalidConfig(format!(
                "max packet size {max_packet_size} leaves no room for a payload"
            )));
        }
        Ok(Self {
            header_width,
            max_packet_size,
            buffer: BytesMut::new(),
        })
    }

    /// Width of the length header in bytes.
    pub fn header_width(&self) -> usize {
        self.header_width
    }

    pub fn max_packet_size(&self) -> u64 {
        self.max_packet_size
    }

    /// Largest payload a single frame can carry.
    pub fn max_payload_len(&self) -> usize {
        (self.max_packet_size - self.header_width as u64) as usize
    }

    /// Rejects a payload whose framed size would exceed the packet limit.
    pub fn check_len(&self, payload_len: usize) -> ProtocolResult<()> {
        let total = self.header_width as u64 + payload_len as u64;
        if total > self.max_packet_size {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: self.max_packet_size,
            });
        }
        Ok(())
    }

    /// Prefixes `payload` with its framed length.
    ///
    /// Only fails when the total cannot be written in `header_width` bytes;
    /// size policy is enforced by [`check_len`](Self::check_len).
    pub fn encode(&self, payload: &[u8]) -> ProtocolResult<Bytes> {
        let total = self.header_width as u64 + payload.len() as u64;
        let mut writer = BinaryWriter::with_capacity(total as usize, Endian::Big);
        writer.put_uint(total, self.header_width)?;
        writer.put_slice(payload);
        Ok(writer.freeze())
    }

    /// Appends received bytes to the internal buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Removes and returns one complete payload, if the buffer holds one.
    ///
    /// Call in a loop after every [`feed`](Self::feed): one read can complete
    /// several frames.
    pub fn try_take_frame(&mut self) -> ProtocolResult<Option<Bytes>> {
        if self.buffer.len() < self.header_width {
            return Ok(None);
        }

        let total = BinaryReader::new(&self.buffer[..self.header_width], Endian::Big)
            .get_uint(self.header_width)?;
        if total < self.header_width as u64 {
            return Err(ProtocolError::malformed_frame(format!(
                "declared length {total} is shorter than the {}-byte header",
                self.header_width
            )));
        }
        if total > self.max_packet_size {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: self.max_packet_size,
            });
        }

        let total = total as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(total);
        let payload = frame.split_off(self.header_width).freeze();
        Ok(Some(payload))
    }

    /// Bytes buffered but not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drops any partially received frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
