//! Connection and listener configuration.

use std::net::SocketAddr;
use std::time::Duration;

use rpcwire_protocol::{
    DEFAULT_MAX_PACKET_SIZE, FragmentCodec, FrameCodec, MAX_FRAGMENT_DATA,
};
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 7420;

/// Per-connection settings, shared by both peers of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Largest framed packet, header included. Also fixes the header width.
    pub max_packet_size: u64,

    /// Largest payload slice carried by one fragment.
    pub max_fragment_data: usize,

    /// How long a caller waits for its response. Zero waits forever.
    #[serde(with = "duration_ms")]
    pub response_timeout: Duration,

    /// Size of the socket read buffer.
    pub receive_buffer_size: usize,

    /// Partially reassembled messages older than this are dropped. Zero
    /// keeps them forever.
    #[serde(with = "duration_ms")]
    pub reassembly_timeout: Duration,

    /// Disable Nagle's algorithm.
    pub nodelay: bool,

    /// Number of idle wait slots kept for reuse.
    pub pool_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_fragment_data: MAX_FRAGMENT_DATA,
            response_timeout: Duration::from_secs(10),
            receive_buffer_size: 64 * 1024,
            reassembly_timeout: Duration::from_secs(60),
            nodelay: true,
            pool_capacity: 64,
        }
    }
}

impl ConnectionConfig {
    /// Builder: set max packet size.
    pub fn with_max_packet_size(mut self, size: u64) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Builder: set max fragment data.
    pub fn with_max_fragment_data(mut self, size: usize) -> Self {
        self.max_fragment_data = size;
        self
    }

    /// Builder: set response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Builder: set receive buffer size.
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    /// Builder: set reassembly timeout.
    pub fn with_reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.reassembly_timeout = timeout;
        self
    }

    /// Builder: set TCP_NODELAY.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Builder: set pool capacity.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Checks that the codecs can be built from these settings.
    ///
    /// A fragment that does not fit one frame is *not* rejected here; that
    /// surfaces when such a message is sent.
    pub fn validate(&self) -> ServerResult<()> {
        FrameCodec::new(self.max_packet_size)?;
        FragmentCodec::new(self.max_fragment_data)?;
        if self.receive_buffer_size == 0 {
            return Err(ServerError::config("receive buffer size must be positive"));
        }
        Ok(())
    }
}

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,

    /// Listen backlog.
    pub backlog: u32,

    /// Settings applied to every accepted connection.
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            backlog: 1024,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Creates a server configuration bound to the given address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builder: set backlog.
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Builder: set connection settings.
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

/// Durations as integer milliseconds in config files.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
