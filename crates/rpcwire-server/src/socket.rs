//! TCP listener for peer connections.
//!
//! Every accepted stream becomes a [`Connection`] serving the listener's
//! [`ServiceRegistry`]. The listener keeps the live set and drops each
//! connection from it once its link closes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::connection::{Connection, EVENT_CAPACITY};
use crate::error::ServerResult;
use crate::service::ServiceRegistry;

/// Notifications about the listener's connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected { id: u64, peer: SocketAddr },
    ClientDisconnected { id: u64, peer: SocketAddr },
}

type ConnectionMap = Arc<Mutex<HashMap<u64, Connection>>>;

/// TCP server hosting a set of services.
pub struct RpcServer {
    config: ServerConfig,
    listener: TcpListener,
    services: Arc<ServiceRegistry>,
    connections: ConnectionMap,
    next_id: AtomicU64,
    events: broadcast::Sender<ServerEvent>,
}

impl RpcServer {
    /// Binds the listening socket.
    pub async fn bind(config: ServerConfig, services: Arc<ServiceRegistry>) -> ServerResult<Self> {
        config.connection.validate()?;

        let addr = config.bind_addr;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.backlog)?;

        info!(
            addr = %listener.local_addr()?,
            services = ?services.names(),
            "RPC server listening"
        );

        Ok(Self {
            config,
            listener,
            services,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            events: broadcast::channel(EVENT_CAPACITY).0,
        })
    }

    /// Address actually bound; useful with port 0.
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Accepts a single connection and starts serving it.
    pub async fn accept(&self) -> ServerResult<Connection> {
        let (stream, peer) = self.listener.accept().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, %peer, "Accepted new connection");

        let connection = Connection::start(
            stream,
            id,
            self.config.connection.clone(),
            self.services.clone(),
            Connection::event_channel(),
        )?;

        lock(&self.connections).insert(id, connection.clone());
        let _ = self.events.send(ServerEvent::ClientConnected { id, peer });

        let watched = connection.clone();
        let connections = self.connections.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            watched.closed().await;
            lock(&connections).remove(&id);
            debug!(id, %peer, "Connection removed");
            let _ = events.send(ServerEvent::ClientDisconnected { id, peer });
        });

        Ok(connection)
    }

    /// Runs the accept loop until an unrecoverable error.
    pub async fn run(&self) -> ServerResult<()> {
        loop {
            if let Err(e) = self.accept().await {
                error!(error = %e, "Failed to accept connection");
                // Continue accepting despite errors
            }
        }
    }

    /// Runs the accept loop until `shutdown` completes, then disconnects
    /// every client.
    pub async fn run_until_shutdown<S>(&self, shutdown: S) -> ServerResult<()>
    where
        S: std::future::Future<Output = ()> + Send,
    {
        let result = tokio::select! {
            result = self.run() => result,
            _ = shutdown => {
                info!("Shutdown signal received");
                Ok(())
            }
        };
        self.shutdown();
        result
    }

    pub fn connection(&self, id: u64) -> Option<Connection> {
        lock(&self.connections).get(&id).cloned()
    }

    pub fn connections(&self) -> Vec<Connection> {
        lock(&self.connections).values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Disconnects every client.
    pub fn shutdown(&self) {
        let connections = self.connections();
        if !connections.is_empty() {
            info!(count = connections.len(), "Disconnecting clients");
        }
        for connection in connections {
            connection.disconnect();
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock(connections: &ConnectionMap) -> MutexGuard<'_, HashMap<u64, Connection>> {
    connections.lock().unwrap_or_else(PoisonError::into_inner)
}
