//! Generic call command.

use serde_json::json;

use rpcwire_protocol::{Param, RequestEnvelope};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::socket::RpcClient;

/// Calls `type_name.method` and prints the result and echoed parameters.
///
/// An error response is printed and returned as [`ClientError::Remote`].
pub async fn run(
    config: &ClientConfig,
    type_name: String,
    method: String,
    params: Vec<Param>,
) -> ClientResult<()> {
    let client = RpcClient::connect(&config.connection).await?;
    let request = RequestEnvelope::new(type_name, method, params);
    let response = client.request(&request).await;
    client.disconnect();

    match response?.into_outcome() {
        Ok((result, params)) => {
            let params: serde_json::Map<_, _> =
                params.into_iter().map(|p| (p.name, p.value)).collect();
            let output = json!({ "result": result, "params": params });
            println!(
                "{}",
                serde_json::to_string_pretty(&output)
                    .map_err(|e| ClientError::Protocol(e.into()))?
            );
            Ok(())
        }
        Err(error) => {
            if let Some(data) = &error.data {
                for (depth, link) in data.chain().enumerate() {
                    eprintln!("{:indent$}caused by: {link}", "", indent = depth * 2);
                }
            }
            Err(ClientError::Remote(error))
        }
    }
}
