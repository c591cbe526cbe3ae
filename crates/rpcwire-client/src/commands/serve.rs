//! Serve command: hosts the Diagnostics service in the foreground.

use std::sync::Arc;

use tracing::info;

use rpcwire_server::{RpcServer, ServiceRegistry, SignalHandler};

use crate::config::ClientConfig;
use crate::diagnostics;
use crate::error::{ClientError, ClientResult};

/// Runs the listener until SIGINT/SIGTERM.
pub async fn run(config: &ClientConfig) -> ClientResult<()> {
    let server_config = config.server_config();

    let services = ServiceRegistry::new();
    services.register(diagnostics::service());

    let signal_handler = SignalHandler::new();
    signal_handler.spawn_listener();

    let server = RpcServer::bind(server_config, Arc::new(services))
        .await
        .map_err(|e| ClientError::Config(format!("failed to start server: {}", e)))?;
    println!("listening on {}", server.local_addr()?);

    server
        .run_until_shutdown(signal_handler.shutdown().wait())
        .await?;

    info!("Server stopped");
    Ok(())
}
