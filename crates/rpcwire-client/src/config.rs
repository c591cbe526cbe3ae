//! Client configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/rpcwire/config.toml` by default:
//!
//! ```toml
//! [connection]
//! address = "127.0.0.1:7420"
//! connect_timeout_ms = 5000
//! response_timeout_ms = 10000
//!
//! [server]
//! bind = "0.0.0.0:7420"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rpcwire_server::{ConnectionConfig, DEFAULT_PORT, ServerConfig};

use crate::error::{ClientError, ClientResult};

/// Configuration for the rpcwire CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Debug mode.
    pub debug: bool,

    /// Outbound connection settings.
    pub connection: ConnectionSettings,

    /// Settings for `rpcwire serve`.
    pub server: ServerSettings,
}

/// Outbound connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Remote peer, `host:port`.
    pub address: String,

    pub connect_timeout_ms: u64,

    /// How long a call waits for its response; 0 waits forever.
    pub response_timeout_ms: u64,

    pub max_packet_size: u64,

    pub max_fragment_data: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            address: format!("127.0.0.1:{DEFAULT_PORT}"),
            connect_timeout_ms: 5_000,
            response_timeout_ms: defaults.response_timeout.as_millis() as u64,
            max_packet_size: defaults.max_packet_size,
            max_fragment_data: defaults.max_fragment_data,
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Per-connection settings derived from this section.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::default()
            .with_response_timeout(self.response_timeout())
            .with_max_packet_size(self.max_packet_size)
            .with_max_fragment_data(self.max_fragment_data)
    }
}

/// Settings for hosting services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to listen on.
    pub bind: SocketAddr,

    /// Listen backlog.
    pub backlog: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            bind: defaults.bind_addr,
            backlog: defaults.backlog,
        }
    }
}

impl ClientConfig {
    /// Loads configuration from the default path.
    pub fn load() -> Result<Self, String> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("failed to read config: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse config: {}", e))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rpcwire")
    }

    /// Listener settings for `serve`, sharing the connection section's
    /// packet limits so both peers agree on them.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.server.bind)
            .with_backlog(self.server.backlog)
            .with_connection(self.connection.connection_config())
    }

    /// Checks that every section can be turned into a working runtime config.
    pub fn validate(&self) -> ClientResult<()> {
        if self.connection.address.trim().is_empty() {
            return Err(ClientError::Config("connection.address is empty".into()));
        }
        if self.connection.connect_timeout_ms == 0 {
            return Err(ClientError::Config(
                "connection.connect_timeout_ms must be positive".into(),
            ));
        }
        self.connection
            .connection_config()
            .validate()
            .map_err(|e| ClientError::Config(e.to_string()))
    }
}
