//! Caller-side dispatch of typed calls.
//!
//! A [`RemoteProxy`] turns a [`RemoteMethod`] descriptor plus argument values
//! into a request envelope, waits for the response on its connection and
//! writes `out`/`ref` values back into the caller's argument slice.
//!
//! Application traits are implemented by thin adapters that forward each
//! method to [`RemoteProxy::invoke`]; see [`crate::diagnostics`].

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument};

use rpcwire_protocol::{Param, RequestEnvelope, decode_response, encode_request};
use rpcwire_server::{Connection, ParamSpec};

use crate::error::{ClientError, ClientResult};

/// A remote interface, addressed by its wire name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInterface {
    name: String,
    alias: Option<String>,
}

impl RemoteInterface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
        }
    }

    /// Builder: name used on the wire instead of `name`.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wire_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// What a remote method gives back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnKind {
    #[default]
    Value,
    Void,
}

/// Descriptor of one remote method overload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMethod {
    name: String,
    alias: Option<String>,
    params: Vec<ParamSpec>,
    returns: ReturnKind,
}

impl RemoteMethod {
    pub fn new(name: impl Into<String>, params: Vec<ParamSpec>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            params,
            returns: ReturnKind::Value,
        }
    }

    /// Builder: name used on the wire instead of `name`.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Builder: the method returns nothing.
    pub fn void(mut self) -> Self {
        self.returns = ReturnKind::Void;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wire_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn returns(&self) -> ReturnKind {
        self.returns
    }
}

/// Issues calls against one remote interface over a connection.
#[derive(Debug, Clone)]
pub struct RemoteProxy {
    connection: Connection,
    interface: RemoteInterface,
    timeout: Duration,
}

impl RemoteProxy {
    /// Creates a proxy using the connection's configured response timeout.
    pub fn new(connection: Connection, interface: RemoteInterface) -> Self {
        let timeout = connection.config().response_timeout;
        Self {
            connection,
            interface,
            timeout,
        }
    }

    /// Builder: override the response timeout. Zero waits forever.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn interface(&self) -> &RemoteInterface {
        &self.interface
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Calls `method` with positional `args`.
    ///
    /// `out` arguments are sent as null; after the call every `out` and
    /// `ref` argument holds the callee's final value. Void methods return
    /// null.
    #[instrument(
        skip_all,
        fields(interface = self.interface.wire_name(), method = method.wire_name())
    )]
    pub async fn invoke(&self, method: &RemoteMethod, args: &mut [Value]) -> ClientResult<Value> {
        if args.len() != method.params.len() {
            return Err(ClientError::InvalidArguments(format!(
                "{}.{} takes {} argument(s), got {}",
                self.interface.wire_name(),
                method.wire_name(),
                method.params.len(),
                args.len()
            )));
        }

        let params = method
            .params
            .iter()
            .zip(args.iter())
            .map(|(spec, value)| {
                let value = if spec.sends_value() {
                    value.clone()
                } else {
                    Value::Null
                };
                Param::new(spec.wire_name(), value)
            })
            .collect();
        let request =
            RequestEnvelope::new(self.interface.wire_name(), method.wire_name(), params);
        let payload = Bytes::from(encode_request(&request)?);

        let response = self.connection.call(payload, self.timeout).await?;
        let (result, echoed) = decode_response(&response)?.into_outcome()?;

        self.check_echo(method, &echoed)?;
        for ((spec, param), arg) in method.params.iter().zip(echoed).zip(args.iter_mut()) {
            if spec.receives_value() {
                *arg = param.value;
            }
        }
        debug!("Call completed");

        Ok(match method.returns {
            ReturnKind::Value => result,
            ReturnKind::Void => Value::Null,
        })
    }

    /// Calls `method` and deserializes its result.
    pub async fn call<R: DeserializeOwned>(
        &self,
        method: &RemoteMethod,
        args: &mut [Value],
    ) -> ClientResult<R> {
        let result = self.invoke(method, args).await?;
        serde_json::from_value(result).map_err(|e| ClientError::Protocol(e.into()))
    }

    fn check_echo(&self, method: &RemoteMethod, echoed: &[Param]) -> ClientResult<()> {
        if echoed.len() != method.params.len() {
            return Err(ClientError::ResponseMismatch(format!(
                "expected {} parameter(s) echoed, got {}",
                method.params.len(),
                echoed.len()
            )));
        }
        for (position, (spec, param)) in method.params.iter().zip(echoed).enumerate() {
            if spec.wire_name() != param.name {
                return Err(ClientError::ResponseMismatch(format!(
                    "parameter {position} echoed as '{}', expected '{}'",
                    param.name,
                    spec.wire_name()
                )));
            }
        }
        Ok(())
    }
}
