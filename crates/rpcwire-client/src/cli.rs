//! Command-line interface definition.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

use rpcwire_protocol::Param;

/// rpcwire - peer-to-peer RPC over TCP
#[derive(Debug, Parser)]
#[command(name = "rpcwire")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "RPCWIRE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Remote peer address (host:port)
    #[arg(long, short, env = "RPCWIRE_ADDRESS")]
    pub address: Option<String>,

    /// Response timeout in milliseconds (0 waits forever)
    #[arg(long)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Host the Diagnostics service until interrupted
    Serve {
        /// Address to listen on
        #[arg(long, short)]
        bind: Option<SocketAddr>,

        /// Write JSON logs
        #[arg(long)]
        json_logs: bool,
    },

    /// Call a remote method and print the response
    Call {
        /// Wire name of the remote type
        #[arg(value_name = "TYPE")]
        type_name: String,

        /// Wire name of the method
        method: String,

        /// Parameters as name=json (bare words are sent as strings)
        #[arg(value_parser = parse_param)]
        params: Vec<Param>,
    },

    /// Round-trip Diagnostics.Echo and report latency
    Ping {
        /// Number of pings
        #[arg(long, short = 'n', default_value_t = 1)]
        count: u32,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Validate configuration
    Validate,

    /// Show configuration file path
    Path,
}

/// Parses `name=value`, reading the value as JSON when possible.
pub fn parse_param(raw: &str) -> Result<Param, String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    if name.is_empty() {
        return Err(format!("missing parameter name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok(Param::new(name, value))
}
