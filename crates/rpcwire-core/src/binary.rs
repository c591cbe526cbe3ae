//! Fixed-width integer packing and length-prefixed blobs.
//!
//! These are the primitives every wire structure in rpcwire is built from.
//! Integers can be written in either byte order; blobs carry a two-byte
//! length prefix in the writer's byte order.
//!
//! ```rust
//! use rpcwire_core::binary::{BinaryReader, BinaryWriter, Endian};
//!
//! let mut writer = BinaryWriter::new(Endian::Big);
//! writer.put_u16(7);
//! writer.put_blob(b"abc").unwrap();
//! let bytes = writer.freeze();
//!
//! let mut reader = BinaryReader::new(&bytes, Endian::Big);
//! assert_eq!(reader.get_u16().unwrap(), 7);
//! assert_eq!(reader.get_blob().unwrap(), b"abc");
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest integer width, in bytes, the primitives can pack.
pub const MAX_UINT_WIDTH: usize = 8;

/// Errors produced while packing or unpacking binary data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BinaryError {
    /// Input ended before a field could be read.
    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },

    /// Value does not fit in the requested width.
    #[error("value {value} does not fit in {width} bytes")]
    ValueTooWide { value: u64, width: usize },

    /// Integer width outside 1..=8.
    #[error("invalid integer width: {0}")]
    InvalidWidth(usize),

    /// Blob longer than its length prefix can express.
    #[error("blob too long: {len} bytes (max: {max})")]
    BlobTooLong { len: usize, max: usize },
}

/// Byte order for multi-byte integers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Endian {
    /// Most significant byte first (network order).
    #[default]
    Big,
    /// Least significant byte first.
    Little,
}

/// Returns the smallest number of bytes able to represent `max`.
///
/// Zero still needs one byte.
pub fn width_for(max: u64) -> usize {
    let bits = u64::BITS - max.leading_zeros();
    (bits as usize).div_ceil(8).max(1)
}

fn check_width(width: usize) -> Result<(), BinaryError> {
    if width == 0 || width > MAX_UINT_WIDTH {
        return Err(BinaryError::InvalidWidth(width));
    }
    Ok(())
}

/// Appends binary fields to a growable buffer.
#[derive(Debug, Default)]
pub struct BinaryWriter {
    buf: BytesMut,
    endian: Endian,
}

impl BinaryWriter {
    /// Creates an empty writer.
    pub fn new(endian: Endian) -> Self {
        Self {
            buf: BytesMut::new(),
            endian,
        }
    }

    /// Creates a writer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize, endian: Endian) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            endian,
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        match self.endian {
            Endian::Big => self.buf.put_u16(value),
            Endian::Little => self.buf.put_u16_le(value),
        }
    }

    pub fn put_i64(&mut self, value: i64) {
        match self.endian {
            Endian::Big => self.buf.put_i64(value),
            Endian::Little => self.buf.put_i64_le(value),
        }
    }

    /// Writes `value` using exactly `width` bytes.
    pub fn put_uint(&mut self, value: u64, width: usize) -> Result<(), BinaryError> {
        check_width(width)?;
        if width < MAX_UINT_WIDTH && value >> (width * 8) != 0 {
            return Err(BinaryError::ValueTooWide { value, width });
        }
        match self.endian {
            Endian::Big => self.buf.put_uint(value, width),
            Endian::Little => self.buf.put_uint_le(value, width),
        }
        Ok(())
    }

    /// Writes a two-byte length prefix followed by the blob.
    pub fn put_blob(&mut self, blob: &[u8]) -> Result<(), BinaryError> {
        let len = u16::try_from(blob.len()).map_err(|_| BinaryError::BlobTooLong {
            len: blob.len(),
            max: u16::MAX as usize,
        })?;
        self.put_u16(len);
        self.buf.put_slice(blob);
        Ok(())
    }

    /// Writes raw bytes with no prefix.
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the writer and returns the written bytes.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads binary fields from a borrowed slice, tracking its position.
#[derive(Debug, Clone)]
pub struct BinaryReader<'a> {
    src: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> BinaryReader<'a> {
    pub fn new(src: &'a [u8], endian: Endian) -> Self {
        Self {
            src,
            pos: 0,
            endian,
        }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.src.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BinaryError> {
        if self.remaining() < n {
            return Err(BinaryError::UnexpectedEnd {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.src[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, BinaryError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, BinaryError> {
        Ok(self.get_uint(2)? as u16)
    }

    pub fn get_i64(&mut self) -> Result<i64, BinaryError> {
        Ok(self.get_uint(8)? as i64)
    }

    /// Reads an unsigned integer stored in exactly `width` bytes.
    pub fn get_uint(&mut self, width: usize) -> Result<u64, BinaryError> {
        check_width(width)?;
        let endian = self.endian;
        let raw = self.take(width)?;
        let value = match endian {
            Endian::Big => raw.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
            Endian::Little => raw
                .iter()
                .rev()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
        };
        Ok(value)
    }

    /// Reads a blob written by [`BinaryWriter::put_blob`].
    pub fn get_blob(&mut self) -> Result<&'a [u8], BinaryError> {
        let len = self.get_u16()? as usize;
        self.take(len)
    }
}
