//! Built-in `Diagnostics` service and its typed client adapter.
//!
//! `rpcwire serve` hosts [`service`]; `rpcwire ping` and the integration
//! tests talk to it through [`DiagnosticsClient`].

use std::future::Future;
use std::sync::LazyLock;

use serde_json::{Value, json};

use rpcwire_protocol::ErrorData;
use rpcwire_server::{MethodEntry, ParamSpec, Service, ServiceFault};

use crate::error::ClientResult;
use crate::proxy::{RemoteInterface, RemoteMethod, RemoteProxy};

/// Wire name of the service.
pub const SERVICE_NAME: &str = "Diagnostics";

static ECHO: LazyLock<RemoteMethod> =
    LazyLock::new(|| RemoteMethod::new("Echo", vec![ParamSpec::input("text")]));
static ADD: LazyLock<RemoteMethod> = LazyLock::new(|| {
    RemoteMethod::new("Add", vec![ParamSpec::input("a"), ParamSpec::input("b")])
});
static SWAP: LazyLock<RemoteMethod> = LazyLock::new(|| {
    RemoteMethod::new("Swap", vec![ParamSpec::by_ref("a"), ParamSpec::by_ref("b")]).void()
});
static FAIL: LazyLock<RemoteMethod> =
    LazyLock::new(|| RemoteMethod::new("Fail", vec![ParamSpec::input("message")]).void());

/// Builds the service answering the methods of [`Diagnostics`].
pub fn service() -> Service {
    Service::new(SERVICE_NAME)
        .method(MethodEntry::new("Echo", vec![ParamSpec::input("text")], |args| {
            Ok(Value::String(args.get(0)?))
        }))
        .method(MethodEntry::new(
            "Add",
            vec![ParamSpec::input("a"), ParamSpec::input("b")],
            |args| {
                let a: i64 = args.get(0)?;
                let b: i64 = args.get(1)?;
                a.checked_add(b)
                    .map(|sum| json!(sum))
                    .ok_or_else(|| ServiceFault::new(format!("{a} + {b} overflows")))
            },
        ))
        .method(
            MethodEntry::new(
                "Swap",
                vec![ParamSpec::by_ref("a"), ParamSpec::by_ref("b")],
                |args| {
                    let a: Value = args.get(0)?;
                    let b: Value = args.get(1)?;
                    args.set(0, b)?;
                    args.set(1, a)?;
                    Ok(Value::Null)
                },
            )
            .void(),
        )
        .method(
            MethodEntry::new("Fail", vec![ParamSpec::input("message")], |args| {
                let message: String = args.get(0)?;
                Err(ServiceFault::new(message)
                    .with_cause(ErrorData::new("requested failure").with_source("Diagnostics")))
            })
            .void(),
        )
}

/// Operations of the built-in service.
pub trait Diagnostics {
    fn echo(&self, text: &str) -> impl Future<Output = ClientResult<String>> + Send;

    fn add(&self, a: i64, b: i64) -> impl Future<Output = ClientResult<i64>> + Send;

    /// Exchanges the two values in place.
    fn swap(&self, a: &mut Value, b: &mut Value)
    -> impl Future<Output = ClientResult<()>> + Send;

    /// Always fails remotely with `message`.
    fn fail(&self, message: &str) -> impl Future<Output = ClientResult<()>> + Send;
}

/// [`Diagnostics`] over a remote connection.
#[derive(Debug, Clone)]
pub struct DiagnosticsClient {
    proxy: RemoteProxy,
}

impl DiagnosticsClient {
    pub fn new(client: &crate::RpcClient) -> Self {
        Self {
            proxy: client.proxy(RemoteInterface::new(SERVICE_NAME)),
        }
    }

    pub fn from_proxy(proxy: RemoteProxy) -> Self {
        Self { proxy }
    }
}

impl Diagnostics for DiagnosticsClient {
    async fn echo(&self, text: &str) -> ClientResult<String> {
        self.proxy.call(&ECHO, &mut [json!(text)]).await
    }

    async fn add(&self, a: i64, b: i64) -> ClientResult<i64> {
        self.proxy.call(&ADD, &mut [json!(a), json!(b)]).await
    }

    async fn swap(&self, a: &mut Value, b: &mut Value) -> ClientResult<()> {
        let mut args = [a.take(), b.take()];
        let result = self.proxy.invoke(&SWAP, &mut args).await;
        let [new_a, new_b] = args;
        *a = new_a;
        *b = new_b;
        result.map(drop)
    }

    async fn fail(&self, message: &str) -> ClientResult<()> {
        self.proxy
            .invoke(&FAIL, &mut [json!(message)])
            .await
            .map(drop)
    }
}
