//! Client error types.

use rpcwire_protocol::{ErrorCode, ProtocolError, RpcError};
use rpcwire_server::ServerError;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not establish the connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// Transport or call failure on an established connection.
    #[error(transparent)]
    Transport(#[from] ServerError),

    /// Envelope encoding or decoding failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The remote peer answered with an error.
    #[error("remote call failed: {0}")]
    Remote(#[from] RpcError),

    /// The echoed parameters do not match the request.
    #[error("response does not match request: {0}")]
    ResponseMismatch(String),

    /// Local arguments do not fit the method descriptor.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

impl ClientError {
    /// Error code describing this failure on the wire's terms.
    ///
    /// Local failures map onto the reserved protocol codes so callers can
    /// handle remote and local errors uniformly.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Remote(error) => error.code,
            Self::ResponseMismatch(_) => ErrorCode::RESPONSE_PARAM_MISMATCH,
            Self::InvalidArguments(_) => ErrorCode::INVALID_PARAMS,
            Self::Transport(ServerError::Timeout { .. }) => ErrorCode::TIMEOUT,
            Self::Transport(e) if e.is_transport() => ErrorCode::NETWORK_ERROR,
            Self::Io(_) | Self::Connection(_) => ErrorCode::NETWORK_ERROR,
            Self::Protocol(_) => ErrorCode::PARSE_ERROR,
            _ => ErrorCode::INTERNAL_ERROR,
        }
    }

    /// The remote error, if the peer answered with one.
    pub fn remote(&self) -> Option<&RpcError> {
        match self {
            Self::Remote(error) => Some(error),
            _ => None,
        }
    }
}
