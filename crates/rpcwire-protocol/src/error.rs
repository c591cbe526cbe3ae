//! Protocol error types.

use rpcwire_core::BinaryError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while framing, fragmenting or encoding messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Framed size exceeds the configured maximum packet size.
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: u64, max: u64 },

    /// Frame header declares an impossible length.
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// Fragment header is inconsistent with its tag's other fragments.
    #[error("malformed fragment for tag {tag}: {reason}")]
    MalformedFragment { tag: i64, reason: String },

    /// Payload needs more fragments than a two-byte count can express.
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Codec configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Binary field could not be packed or unpacked.
    #[error("binary encoding failed: {0}")]
    Binary(#[from] BinaryError),

    /// Failed to serialize or parse an envelope.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Envelope carries a version this build does not speak.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),
}

impl ProtocolError {
    pub fn malformed_frame(reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
        }
    }

    pub fn malformed_fragment(tag: i64, reason: impl Into<String>) -> Self {
        Self::MalformedFragment {
            tag,
            reason: reason.into(),
        }
    }
}
