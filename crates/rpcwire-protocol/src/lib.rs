//! Wire protocol for rpcwire.
//!
//! The stack, from the socket up:
//!
//! 1. [`FrameCodec`] turns the TCP byte stream into discrete packets using a
//!    big-endian total-length header whose width is derived from the
//!    configured maximum packet size.
//! 2. [`FragmentCodec`] splits each logical message into bounded
//!    [`Fragment`]s (one per frame) tagged with a correlation id, and the
//!    [`Reassembler`] joins them back into a [`Message`].
//! 3. The message data is a JSON [`RequestEnvelope`] or [`ResponseEnvelope`].
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use rpcwire_protocol::{
//!     encode_request, FragmentCodec, FrameCodec, Fragment, MessageKind, Param, Reassembler,
//!     RequestEnvelope,
//! };
//!
//! let request = RequestEnvelope::new("IService", "Echo", vec![Param::new("text", "hi")]);
//! let data = Bytes::from(encode_request(&request).unwrap());
//!
//! let mut frames = FrameCodec::new(65_535).unwrap();
//! let reassembler = Reassembler::new();
//! for fragment in FragmentCodec::default().split(MessageKind::Request, 1, data.clone()).unwrap() {
//!     let frame = frames.encode(&fragment.encode().unwrap()).unwrap();
//!     frames.feed(&frame);
//! }
//! while let Some(payload) = frames.try_take_frame().unwrap() {
//!     reassembler.push(Fragment::decode(payload).unwrap()).unwrap();
//! }
//! assert_eq!(reassembler.try_pull().unwrap().data, data);
//! ```

mod error;
mod fragment;
mod framing;
mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use fragment::{
    FRAGMENT_HEADER_SIZE, Fragment, FragmentCodec, MAX_FRAGMENT_DATA, Message, MessageKind,
    Reassembler,
};
pub use framing::FrameCodec;
pub use types::{
    ErrorCode, ErrorData, FALLBACK_ERROR_RESPONSE, Param, RequestEnvelope, ResponseEnvelope,
    RpcError, decode_request, decode_response, encode_request, encode_response,
};

/// Envelope version spoken by this build.
pub const PROTOCOL_VERSION: &str = "1";

/// Default maximum packet size, giving a two-byte frame header.
pub const DEFAULT_MAX_PACKET_SIZE: u64 = 65_535;
