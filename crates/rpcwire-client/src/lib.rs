//! Client side of rpcwire: connector, typed proxies and the `rpcwire` CLI.
//!
//! ```rust,no_run
//! use rpcwire_client::{Diagnostics, DiagnosticsClient, RpcClient};
//! use rpcwire_client::config::ConnectionSettings;
//!
//! # async fn demo() -> rpcwire_client::ClientResult<()> {
//! let client = RpcClient::connect(&ConnectionSettings::default()).await?;
//! let diagnostics = DiagnosticsClient::new(&client);
//! assert_eq!(diagnostics.add(2, 3).await?, 5);
//! client.disconnect();
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod proxy;
pub mod socket;

pub use cli::Cli;
pub use diagnostics::{Diagnostics, DiagnosticsClient};
pub use error::{ClientError, ClientResult};
pub use proxy::{RemoteInterface, RemoteMethod, RemoteProxy, ReturnKind};
pub use socket::{Connector, RpcClient};
