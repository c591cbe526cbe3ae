//! Ping command.

use std::time::Instant;

use crate::config::ClientConfig;
use crate::diagnostics::{Diagnostics, DiagnosticsClient};
use crate::error::{ClientError, ClientResult};
use crate::socket::RpcClient;

/// Echoes a token `count` times and prints each round trip.
pub async fn run(config: &ClientConfig, count: u32) -> ClientResult<()> {
    let client = RpcClient::connect(&config.connection).await?;
    let diagnostics = DiagnosticsClient::new(&client);

    let result = async {
        for seq in 0..count {
            let token = format!("ping-{seq}");
            let started = Instant::now();
            let echoed = diagnostics.echo(&token).await?;
            if echoed != token {
                return Err(ClientError::ResponseMismatch(format!(
                    "sent '{token}', got '{echoed}'"
                )));
            }
            println!(
                "reply from {}: seq={} time={:.2}ms",
                client.connection().peer_addr(),
                seq,
                started.elapsed().as_secs_f64() * 1000.0
            );
        }
        Ok(())
    }
    .await;

    client.disconnect();
    result
}
