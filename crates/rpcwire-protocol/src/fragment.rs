//! Splitting of large RPC payloads into bounded fragments and their
//! reassembly by correlation tag.
//!
//! Each frame carries exactly one fragment:
//!
//! ```text
//! +------+---------+---------+---------+-------------+------+
//! | kind | tag     | index   | count   | data_length | data |
//! | 1    | 8 (i64) | 2 (u16) | 2 (u16) | 2 (u16)     | ...  |
//! +------+---------+---------+---------+-------------+------+
//! ```
//!
//! The fragment bound is independent of the frame size limit, so a single
//! call can span many TCP frames.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rpcwire_core::{BinaryReader, BinaryWriter, Endian};

use crate::error::{ProtocolError, ProtocolResult};

/// Default upper bound on a fragment's data, in bytes.
pub const MAX_FRAGMENT_DATA: usize = 60_000;

/// Fixed part of an encoded fragment preceding its data.
pub const FRAGMENT_HEADER_SIZE: usize = 1 + 8 + 2 + 2 + 2;

/// Whether a message starts a call or answers one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0x10,
    Response = 0x20,
}

impl MessageKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x10 => Some(Self::Request),
            0x20 => Some(Self::Response),
            _ => None,
        }
    }
}

/// One piece of a logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub kind: MessageKind,
    pub tag: i64,
    pub index: u16,
    pub count: u16,
    pub data: Bytes,
}

impl Fragment {
    /// Serializes the fragment into its wire layout.
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        let mut writer =
            BinaryWriter::with_capacity(FRAGMENT_HEADER_SIZE + self.data.len(), Endian::Big);
        writer.put_u8(self.kind.as_u8());
        writer.put_i64(self.tag);
        writer.put_u16(self.index);
        writer.put_u16(self.count);
        writer.put_blob(&self.data)?;
        Ok(writer.freeze())
    }

    /// Parses a fragment from one frame payload.
    ///
    /// The returned data shares the frame's buffer.
    pub fn decode(frame: Bytes) -> ProtocolResult<Self> {
        let mut reader = BinaryReader::new(&frame, Endian::Big);
        let kind_byte = reader.get_u8()?;
        let tag = reader.get_i64()?;
        let kind = MessageKind::from_u8(kind_byte).ok_or_else(|| {
            ProtocolError::malformed_fragment(tag, format!("unknown kind 0x{kind_byte:02X}"))
        })?;
        let index = reader.get_u16()?;
        let count = reader.get_u16()?;
        let len = reader.get_u16()? as usize;
        let start = reader.position();
        if reader.remaining() != len {
            return Err(ProtocolError::malformed_fragment(
                tag,
                format!(
                    "data length {len} does not match {} remaining bytes",
                    reader.remaining()
                ),
            ));
        }
        Ok(Self {
            kind,
            tag,
            index,
            count,
            data: frame.slice(start..start + len),
        })
    }
}

/// A fully reassembled logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub tag: i64,
    pub data: Bytes,
}

/// Splits payloads into fragments of bounded size.
#[derive(Debug, Clone, Copy)]
pub struct FragmentCodec {
    max_data: usize,
}

impl Default for FragmentCodec {
    fn default() -> Self {
        Self {
            max_data: MAX_FRAGMENT_DATA,
        }
    }
}

impl FragmentCodec {
    /// Creates a codec with a custom data bound (1..=65 535 bytes).
    pub fn new(max_data: usize) -> ProtocolResult<Self> {
        if max_data == 0 || max_data > u16::MAX as usize {
            return Err(ProtocolError::InvalidConfig(format!(
                "fragment data bound must be within 1..={}, got {max_data}",
                u16::MAX
            )));
        }
        Ok(Self { max_data })
    }

    pub fn max_data(&self) -> usize {
        self.max_data
    }

    /// Size of the largest encoded fragment this codec produces.
    pub fn max_encoded_len(&self) -> usize {
        FRAGMENT_HEADER_SIZE + self.max_data
    }

    /// Splits `payload` into ordered fragments sharing `tag`.
    ///
    /// An empty payload still produces one (empty) fragment.
    pub fn split(&self, kind: MessageKind, tag: i64, payload: Bytes) -> ProtocolResult<Vec<Fragment>> {
        let max_payload = self.max_data * u16::MAX as usize;
        if payload.len() > max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: max_payload,
            });
        }

        let count = payload.len().div_ceil(self.max_data).max(1);
        let mut fragments = Vec::with_capacity(count);
        for index in 0..count {
            let start = (index * self.max_data).min(payload.len());
            let end = (start + self.max_data).min(payload.len());
            fragments.push(Fragment {
                kind,
                tag,
                index: index as u16,
                count: count as u16,
                data: payload.slice(start..end),
            });
        }
        Ok(fragments)
    }
}

/// Parts are stored sparsely so memory follows the bytes actually
/// received, not the count a peer declares.
#[derive(Debug)]
struct PartialMessage {
    count: u16,
    parts: BTreeMap<u16, Bytes>,
    started: Instant,
}

impl PartialMessage {
    fn new(count: u16) -> Self {
        Self {
            count,
            parts: BTreeMap::new(),
            started: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.parts.len() == self.count as usize
    }

    fn concat(self) -> Bytes {
        if self.parts.len() == 1 {
            return self.parts.into_values().next().unwrap_or_default();
        }
        let len = self.parts.values().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(len);
        for part in self.parts.into_values() {
            out.extend_from_slice(&part);
        }
        out.freeze()
    }
}

type PartialKey = (MessageKind, i64);

#[derive(Debug, Default)]
struct ReassemblyTable {
    partial: HashMap<PartialKey, PartialMessage>,
    ready: VecDeque<PartialKey>,
}

/// Collects fragments per tag until each message is complete.
///
/// Pushes and pulls may come from different tasks; the whole table sits
/// behind one lock. Request and response tags are tracked separately since
/// both peers allocate tags independently.
#[derive(Debug, Default)]
pub struct Reassembler {
    table: Mutex<ReassemblyTable>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReassemblyTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores a fragment. Returns `true` when it completed its message.
    ///
    /// Duplicate indices are ignored.
    pub fn push(&self, fragment: Fragment) -> ProtocolResult<bool> {
        let Fragment {
            kind,
            tag,
            index,
            count,
            data,
        } = fragment;
        if count == 0 {
            return Err(ProtocolError::malformed_fragment(tag, "fragment count is zero"));
        }
        if index >= count {
            return Err(ProtocolError::malformed_fragment(
                tag,
                format!("index {index} out of range for count {count}"),
            ));
        }

        let key = (kind, tag);
        let mut table = self.lock();
        let partial = table
            .partial
            .entry(key)
            .or_insert_with(|| PartialMessage::new(count));
        if partial.count != count {
            return Err(ProtocolError::malformed_fragment(
                tag,
                format!("count {count} disagrees with earlier count {}", partial.count),
            ));
        }

        if partial.parts.contains_key(&index) {
            return Ok(false);
        }
        partial.parts.insert(index, data);

        if partial.is_complete() {
            table.ready.push_back(key);
            return Ok(true);
        }
        Ok(false)
    }

    /// Removes and returns the earliest completed message.
    pub fn try_pull(&self) -> Option<Message> {
        let mut table = self.lock();
        while let Some(key) = table.ready.pop_front() {
            if let Some(partial) = table.partial.remove(&key) {
                let (kind, tag) = key;
                return Some(Message {
                    kind,
                    tag,
                    data: partial.concat(),
                });
            }
        }
        None
    }

    /// Drops incomplete messages whose first fragment arrived more than
    /// `max_age` ago. Returns how many were dropped.
    pub fn evict_stale(&self, max_age: Duration) -> usize {
        let mut table = self.lock();
        let before = table.partial.len();
        table
            .partial
            .retain(|_, partial| partial.is_complete() || partial.started.elapsed() < max_age);
        before - table.partial.len()
    }

    /// Number of tags with at least one fragment and no pulled message yet.
    pub fn pending(&self) -> usize {
        self.lock().partial.len()
    }

    pub fn clear(&self) {
        let mut table = self.lock();
        table.partial.clear();
        table.ready.clear();
    }
}
