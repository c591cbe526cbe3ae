//! Request dispatch to registered services.
//!
//! [`ServiceInvoker::handle`] turns one request payload into one response
//! payload. It never fails: every problem, from unparsable JSON to a
//! panicking handler, becomes an error response for the caller.

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::{Instrument, debug, error, info_span, warn};

use rpcwire_protocol::{
    ErrorData, FALLBACK_ERROR_RESPONSE, PROTOCOL_VERSION, RequestEnvelope, ResponseEnvelope,
    RpcError, encode_response,
};

use crate::service::{Arguments, MethodEntry, ServiceFault, ServiceRegistry};

/// Executes inbound requests against a [`ServiceRegistry`].
#[derive(Debug, Clone)]
pub struct ServiceInvoker {
    registry: Arc<ServiceRegistry>,
}

impl ServiceInvoker {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Handles one request payload and returns the encoded response.
    pub async fn handle(&self, payload: &[u8]) -> Bytes {
        let response = match parse_request(payload) {
            Ok(request) => {
                let span = info_span!(
                    "invoke",
                    type_name = %request.type_name,
                    method = %request.method,
                    outcome = tracing::field::Empty,
                );
                self.dispatch(request).instrument(span).await
            }
            Err(error) => {
                debug!(code = %error.code, error = %error.message, "Rejected request payload");
                ResponseEnvelope::failure(error)
            }
        };
        encode_or_fallback(&response)
    }

    /// Resolves and runs a parsed request.
    pub async fn dispatch(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let span = tracing::Span::current();
        let entry = match self.resolve(&request) {
            Ok(entry) => entry,
            Err(error) => {
                span.record("outcome", "rejected");
                debug!(code = %error.code, error = %error.message, "Could not resolve request");
                return ResponseEnvelope::failure(error);
            }
        };

        let source = format!("{}.{}", request.type_name, request.method);
        let args = prepare_arguments(&entry, request.params);

        let returns_value = entry.returns_value();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut args = args;
            let result = entry.invoke(&mut args);
            (args, result)
        })
        .await;

        match outcome {
            Ok((args, Ok(result))) => {
                span.record("outcome", "completed");
                let result = returns_value.then_some(result);
                ResponseEnvelope::success(result, args.into_params())
            }
            Ok((_, Err(fault))) => {
                span.record("outcome", "faulted");
                ResponseEnvelope::failure(fault_to_error(&fault, &source))
            }
            Err(join_error) if join_error.is_panic() => {
                span.record("outcome", "faulted");
                let message = panic_message(join_error.into_panic());
                warn!(%source, %message, "Service handler panicked");
                ResponseEnvelope::failure(RpcError::application(
                    message.clone(),
                    ErrorData::new(message).with_source(source),
                ))
            }
            Err(join_error) => {
                span.record("outcome", "faulted");
                error!(%source, error = %join_error, "Service handler was cancelled");
                ResponseEnvelope::failure(RpcError::internal("handler was cancelled"))
            }
        }
    }

    /// Finds the overload whose positional parameter names match the request.
    fn resolve(&self, request: &RequestEnvelope) -> Result<MethodEntry, RpcError> {
        let service = self
            .registry
            .lookup(&request.type_name)
            .ok_or_else(|| RpcError::type_not_found(&request.type_name))?;
        let overloads = service
            .overloads(&request.method)
            .ok_or_else(|| RpcError::method_not_found(&request.type_name, &request.method))?;

        let names: Vec<&str> = request.param_names().collect();
        let mut first_mismatch = None;
        for entry in overloads {
            match entry.check_params(names.iter().copied()) {
                Ok(()) => return Ok(entry.clone()),
                Err(position) if entry.params().len() == names.len() => {
                    first_mismatch.get_or_insert((entry, position));
                }
                Err(_) => {}
            }
        }

        let message = match first_mismatch {
            Some((entry, position)) => format!(
                "parameter {position} of {}.{} must be named '{}', got '{}'",
                request.type_name,
                request.method,
                entry.params()[position].wire_name(),
                names[position]
            ),
            None => format!(
                "no overload of {}.{} takes {} parameter(s)",
                request.type_name,
                request.method,
                names.len()
            ),
        };
        Err(RpcError::invalid_params(message))
    }
}

fn parse_request(payload: &[u8]) -> Result<RequestEnvelope, RpcError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| RpcError::parse_error(e.to_string()))?;
    let request: RequestEnvelope =
        serde_json::from_value(value).map_err(|e| RpcError::invalid_request(e.to_string()))?;
    if !request.is_compatible() {
        return Err(RpcError::invalid_request(format!(
            "unsupported protocol version '{}' (expected '{PROTOCOL_VERSION}')",
            request.version
        )));
    }
    Ok(request)
}

/// Builds handler arguments; `out` parameters start as null.
fn prepare_arguments(entry: &MethodEntry, params: Vec<rpcwire_protocol::Param>) -> Arguments {
    let params = params
        .into_iter()
        .zip(entry.params())
        .map(|(mut param, spec)| {
            if !spec.sends_value() {
                param.value = Value::Null;
            }
            param
        })
        .collect();
    Arguments::new(params)
}

fn fault_to_error(fault: &ServiceFault, source: &str) -> RpcError {
    match fault {
        ServiceFault::InvalidArgument { .. } => RpcError::invalid_params(fault.to_string()),
        ServiceFault::Failed { message, .. } => {
            RpcError::application(message.clone(), fault.to_error_data(source))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "service handler panicked".to_string()
    }
}

fn encode_or_fallback(response: &ResponseEnvelope) -> Bytes {
    match encode_response(response) {
        Ok(encoded) => Bytes::from(encoded),
        Err(e) => {
            error!(error = %e, "Failed to encode response");
            let internal = ResponseEnvelope::failure(RpcError::internal(format!(
                "failed to encode response: {e}"
            )));
            match encode_response(&internal) {
                Ok(encoded) => Bytes::from(encoded),
                Err(_) => Bytes::from_static(FALLBACK_ERROR_RESPONSE),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ParamSpec, Service};
    use rpcwire_protocol::{ErrorCode, Param, decode_response, encode_request};
    use serde_json::json;

    fn invoker() -> ServiceInvoker {
        let registry = ServiceRegistry::new();
        registry.register(
            Service::new("IService")
                .method(MethodEntry::new(
                    "Echo",
                    vec![ParamSpec::input("text")],
                    |args| Ok(Value::String(args.get(0)?)),
                ))
                .method(MethodEntry::new(
                    "Echo",
                    vec![ParamSpec::input("text"), ParamSpec::input("times")],
                    |args| {
                        let text: String = args.get(0)?;
                        Ok(Value::String(text.repeat(args.get(1)?)))
                    },
                ))
                .method(MethodEntry::new(
                    "Split",
                    vec![ParamSpec::input("whole"), ParamSpec::output("half")],
                    |args| {
                        let whole: i64 = args.get(0)?;
                        args.set(1, whole / 2)?;
                        Ok(Value::Null)
                    },
                ).void())
                .method(MethodEntry::new(
                    "Bump",
                    vec![ParamSpec::by_ref("counter")],
                    |args| {
                        let n: i64 = args.get(0)?;
                        args.set(0, n + 1)?;
                        Ok(json!(n))
                    },
                ))
                .method(MethodEntry::new("HelloMethod", vec![], |_| {
                    Err(ServiceFault::new("Hello from the other side"))
                }))
                .method(MethodEntry::new("Explode", vec![], |_| panic!("kaboom"))),
        );
        ServiceInvoker::new(Arc::new(registry))
    }

    async fn call(invoker: &ServiceInvoker, request: RequestEnvelope) -> ResponseEnvelope {
        let payload = encode_request(&request).unwrap();
        decode_response(&invoker.handle(&payload).await).unwrap()
    }

    fn error_code(response: &ResponseEnvelope) -> ErrorCode {
        response.error.as_ref().unwrap().code
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let response = call(
            &invoker(),
            RequestEnvelope::new("IService", "Echo", vec![Param::new("text", "hi")]),
        )
        .await;
        assert!(response.is_success());
        assert_eq!(response.result, Some(json!("hi")));
        assert_eq!(response.params, vec![Param::new("text", "hi")]);
    }

    #[tokio::test]
    async fn overload_chosen_by_count() {
        let response = call(
            &invoker(),
            RequestEnvelope::new(
                "IService",
                "Echo",
                vec![Param::new("text", "ab"), Param::new("times", 3)],
            ),
        )
        .await;
        assert_eq!(response.result, Some(json!("ababab")));
    }

    #[tokio::test]
    async fn malformed_payloads() {
        let invoker = invoker();
        let garbage = decode_response(&invoker.handle(b"{not json").await).unwrap();
        assert_eq!(error_code(&garbage), ErrorCode::PARSE_ERROR);

        let wrong_shape = decode_response(&invoker.handle(br#"{"hello": 1}"#).await).unwrap();
        assert_eq!(error_code(&wrong_shape), ErrorCode::INVALID_REQUEST);

        let old = decode_response(
            &invoker
                .handle(br#"{"version":"0","type":"IService","method":"Echo","params":[]}"#)
                .await,
        )
        .unwrap();
        assert_eq!(error_code(&old), ErrorCode::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn unknown_type_and_method() {
        let invoker = invoker();
        let response = call(&invoker, RequestEnvelope::new("Nope", "Echo", vec![])).await;
        assert_eq!(error_code(&response), ErrorCode::TYPE_NOT_FOUND);

        let response = call(&invoker, RequestEnvelope::new("IService", "Nope", vec![])).await;
        assert_eq!(error_code(&response), ErrorCode::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn parameter_name_mismatch_names_position() {
        let response = call(
            &invoker(),
            RequestEnvelope::new(
                "IService",
                "Echo",
                vec![Param::new("text", "a"), Param::new("count", 2)],
            ),
        )
        .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, ErrorCode::INVALID_PARAMS);
        insta::assert_snapshot!(
            error.message,
            @"parameter 1 of IService.Echo must be named 'times', got 'count'"
        );
    }

    #[tokio::test]
    async fn parameter_count_mismatch() {
        let response = call(
            &invoker(),
            RequestEnvelope::new("IService", "HelloMethod", vec![Param::new("x", 1)]),
        )
        .await;
        assert_eq!(error_code(&response), ErrorCode::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn bad_argument_type_is_invalid_params() {
        let response = call(
            &invoker(),
            RequestEnvelope::new("IService", "Echo", vec![Param::new("text", 42)]),
        )
        .await;
        assert_eq!(error_code(&response), ErrorCode::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn out_param_is_filled_and_void_result_omitted() {
        let response = call(
            &invoker(),
            RequestEnvelope::new(
                "IService",
                "Split",
                vec![Param::new("whole", 10), Param::new("half", "ignored")],
            ),
        )
        .await;
        assert!(response.is_success());
        assert_eq!(response.result, None);
        assert_eq!(response.params[1], Param::new("half", 5));
    }

    #[tokio::test]
    async fn ref_param_is_written_back() {
        let response = call(
            &invoker(),
            RequestEnvelope::new("IService", "Bump", vec![Param::new("counter", 41)]),
        )
        .await;
        assert_eq!(response.result, Some(json!(41)));
        assert_eq!(response.params, vec![Param::new("counter", 42)]);
    }

    #[tokio::test]
    async fn handler_fault_is_application_error() {
        let response = call(
            &invoker(),
            RequestEnvelope::new("IService", "HelloMethod", vec![]),
        )
        .await;
        let error = response.error.unwrap();
        assert!(error.is_application());
        let data = error.data.unwrap();
        assert_eq!(data.message, "Hello from the other side");
        assert_eq!(data.source.as_deref(), Some("IService.HelloMethod"));
    }

    #[tokio::test]
    async fn handler_panic_is_application_error() {
        let response = call(&invoker(), RequestEnvelope::new("IService", "Explode", vec![])).await;
        let error = response.error.unwrap();
        assert!(error.is_application());
        assert_eq!(error.message, "kaboom");
    }
}
