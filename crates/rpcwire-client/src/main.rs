//! rpcwire CLI entry point.

use std::process::ExitCode;

use clap::Parser;
use tracing::Level;

use rpcwire_client::cli::{Cli, Command, ConfigAction};
use rpcwire_client::commands;
use rpcwire_client::config::ClientConfig;
use rpcwire_client::error::{ClientError, ClientResult};
use rpcwire_core::{TracingConfig, TracingOutputFormat, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_tracing(tracing_config(&cli.command, config.debug)) {
        eprintln!("warning: {}", e);
    }

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Loads the config file and applies command-line overrides.
fn load_config(cli: &Cli) -> ClientResult<ClientConfig> {
    let mut config = if let Some(ref path) = cli.config {
        ClientConfig::load_from(path).map_err(ClientError::Config)?
    } else {
        ClientConfig::load().unwrap_or_default()
    };

    // Command-line flags win over the file.
    if let Some(address) = &cli.address {
        config.connection.address = address.clone();
    }
    if let Some(timeout) = cli.timeout {
        config.connection.response_timeout_ms = timeout;
    }
    if let Command::Serve {
        bind: Some(bind), ..
    } = &cli.command
    {
        config.server.bind = *bind;
    }
    config.debug |= cli.debug;

    Ok(config)
}

fn tracing_config(command: &Command, debug: bool) -> TracingConfig {
    match command {
        _ if debug => TracingConfig::cli_debug(),
        Command::Serve {
            json_logs: true, ..
        } => TracingConfig::daemon(),
        Command::Serve { .. } => TracingConfig::default()
            .with_level(Level::INFO)
            .with_format(TracingOutputFormat::Compact),
        _ => TracingConfig::default()
            .with_level(Level::WARN)
            .with_format(TracingOutputFormat::Compact),
    }
}

async fn run(command: Command, config: ClientConfig) -> ClientResult<()> {
    match command {
        Command::Serve { .. } => {
            config.validate()?;
            commands::serve::run(&config).await
        }
        Command::Call {
            type_name,
            method,
            params,
        } => commands::call::run(&config, type_name, method, params).await,
        Command::Ping { count } => commands::ping::run(&config, count).await,
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config),
            ConfigAction::Validate => commands::config::validate(&config),
            ConfigAction::Path => commands::config::path(),
        },
    }
}
