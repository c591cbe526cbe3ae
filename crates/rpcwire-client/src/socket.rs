//! TCP connector for reaching a remote peer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::debug;

use rpcwire_protocol::{RequestEnvelope, ResponseEnvelope, decode_response, encode_request};
use rpcwire_server::{Connection, ConnectionConfig, ConnectionEvent, ServiceRegistry};

use crate::config::ConnectionSettings;
use crate::error::{ClientError, ClientResult};
use crate::proxy::{RemoteInterface, RemoteProxy};

/// Connection id used for outbound links.
const CLIENT_CONNECTION_ID: u64 = 0;

/// Builds outbound connections.
///
/// Services registered here answer calls the remote peer makes back over
/// the same link.
pub struct Connector {
    address: String,
    connect_timeout: Duration,
    config: ConnectionConfig,
    services: Arc<ServiceRegistry>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Connector {
    /// Creates a connector for `address` (`host:port`) with default settings.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(5),
            config: ConnectionConfig::default(),
            services: Arc::new(ServiceRegistry::new()),
            events: Connection::event_channel(),
        }
    }

    /// Creates a connector from the `[connection]` config section.
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self::new(settings.address.clone())
            .with_connect_timeout(settings.connect_timeout())
            .with_config(settings.connection_config())
    }

    /// Builder: set connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder: set connection settings.
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Builder: serve these services to the remote peer.
    pub fn with_services(mut self, services: Arc<ServiceRegistry>) -> Self {
        self.services = services;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Subscribes to events of connections made from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Connects and starts the link.
    pub async fn connect(&self) -> ClientResult<RpcClient> {
        debug!(address = %self.address, "connecting to peer");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                ClientError::Connection(format!(
                    "connection to {} timed out after {}ms",
                    self.address,
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| {
                ClientError::Connection(format!("failed to connect to {}: {}", self.address, e))
            })?;

        let connection = Connection::start(
            stream,
            CLIENT_CONNECTION_ID,
            self.config.clone(),
            self.services.clone(),
            self.events.clone(),
        )?;
        Ok(RpcClient { connection })
    }
}

/// A connected peer.
#[derive(Debug, Clone)]
pub struct RpcClient {
    connection: Connection,
}

impl RpcClient {
    /// Connects using the `[connection]` config section.
    pub async fn connect(settings: &ConnectionSettings) -> ClientResult<Self> {
        Connector::from_settings(settings).connect().await
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Proxy for calls against `interface`.
    pub fn proxy(&self, interface: RemoteInterface) -> RemoteProxy {
        RemoteProxy::new(self.connection.clone(), interface)
    }

    /// Sends a prepared request and returns the raw response envelope.
    ///
    /// Error responses are returned as envelopes, not as `Err`.
    pub async fn request(&self, request: &RequestEnvelope) -> ClientResult<ResponseEnvelope> {
        let payload = Bytes::from(encode_request(request)?);
        let response = self
            .connection
            .call(payload, self.connection.config().response_timeout)
            .await?;
        Ok(decode_response(&response)?)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }
}
