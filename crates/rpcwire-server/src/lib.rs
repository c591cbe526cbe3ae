//! Peer runtime: connections, call correlation, services and the listener.
//!
//! This crate provides:
//! - [`Connection`], a bidirectional RPC link over one TCP stream
//! - [`CorrelationTable`], which matches responses to waiting callers
//! - [`ServiceRegistry`] and [`ServiceInvoker`] for serving inbound calls
//! - [`RpcServer`], a TCP listener hosting a registry
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rpcwire_server::{MethodEntry, ParamSpec, RpcServer, ServerConfig, Service, ServiceRegistry};
//! use serde_json::Value;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let services = ServiceRegistry::new();
//!     services.register(Service::new("IService").method(MethodEntry::new(
//!         "Echo",
//!         vec![ParamSpec::input("text")],
//!         |args| Ok(Value::String(args.get(0)?)),
//!     )));
//!
//!     let server = RpcServer::bind(ServerConfig::default(), Arc::new(services)).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod correlation;
mod error;
mod handler;
mod service;
mod signals;
mod socket;

pub use config::{ConnectionConfig, DEFAULT_PORT, ServerConfig, duration_ms};
pub use connection::{Connection, ConnectionEvent, EVENT_CAPACITY};
pub use correlation::{CorrelationTable, PendingCall, PendingGuard, WaitOutcome};
pub use error::{ServerError, ServerResult};
pub use handler::ServiceInvoker;
pub use service::{
    Arguments, MethodEntry, MethodHandler, ParamDirection, ParamSpec, Service, ServiceFault,
    ServiceRegistry,
};
pub use signals::{ShutdownSignal, SignalHandler};
pub use socket::{RpcServer, ServerEvent};
