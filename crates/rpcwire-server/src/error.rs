//! Server error types.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur on a connection or in the listener.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (socket, bind, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (framing, fragmenting, encoding).
    #[error("Protocol error: {0}")]
    Protocol(#[from] rpcwire_protocol::ProtocolError),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The connection is not running.
    #[error("Not connected")]
    NotConnected,

    /// Another call is already waiting on this tag.
    #[error("Tag {tag} already has a pending call")]
    TagInUse { tag: i64 },

    /// No response arrived within the timeout.
    #[error("Timed out after {timeout:?} waiting for response to tag {tag}")]
    Timeout { tag: i64, timeout: Duration },

    /// The connection closed while a call was waiting.
    #[error("Connection closed while waiting for response to tag {tag}")]
    ConnectionClosed { tag: i64 },

    /// Shutdown requested.
    #[error("Server shutdown requested")]
    Shutdown,
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true for failures of the transport rather than of one call.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::NotConnected | Self::ConnectionClosed { .. }
        )
    }
}
