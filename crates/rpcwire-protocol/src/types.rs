//! Request/response envelopes and the structured error model.

use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::PROTOCOL_VERSION;
use crate::error::{ProtocolError, ProtocolResult};

/// One named parameter on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

impl Param {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A call to `type.method` with named parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub version: String,
    /// Wire name of the target interface.
    #[serde(rename = "type")]
    pub type_name: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Param>,
}

impl RequestEnvelope {
    pub fn new(type_name: impl Into<String>, method: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            type_name: type_name.into(),
            method: method.into(),
            params,
        }
    }

    /// Parameter wire names in request order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    pub fn is_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

/// The answer to a request: a result with echoed parameters, or an error.
///
/// A success always carries both `result` (null for void methods) and
/// `params`; a failure carries only `error`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponseEnvelope {
    pub version: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl Serialize for ResponseEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("version", &self.version)?;
        match &self.error {
            Some(error) => map.serialize_entry("error", error)?,
            None => {
                map.serialize_entry("result", &self.result)?;
                map.serialize_entry("params", &self.params)?;
            }
        }
        map.end()
    }
}

impl ResponseEnvelope {
    /// Successful response. `result` is `None` for void methods.
    pub fn success(result: Option<Value>, params: Vec<Param>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            result,
            params,
            error: None,
        }
    }

    pub fn failure(error: RpcError) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            result: None,
            params: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Splits into `(result, params)` or the carried error.
    ///
    /// A missing or null result becomes [`Value::Null`].
    pub fn into_outcome(self) -> Result<(Value, Vec<Param>), RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok((self.result.unwrap_or(Value::Null), self.params)),
        }
    }
}

/// Numeric error code carried in error responses.
///
/// Codes in [`PROTOCOL_RANGE`](Self::PROTOCOL_RANGE) mean the call itself
/// was malformed or could not be delivered; codes in
/// [`APPLICATION_RANGE`](Self::APPLICATION_RANGE) mean the remote method ran
/// and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    /// No overload matches the request's parameter count and names.
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);
    pub const TYPE_NOT_FOUND: Self = Self(-32604);
    /// Echoed response parameters do not match the request.
    pub const RESPONSE_PARAM_MISMATCH: Self = Self(-32605);
    pub const NETWORK_ERROR: Self = Self(-32000);
    pub const TIMEOUT: Self = Self(-32001);
    pub const APPLICATION_ERROR: Self = Self(-31000);

    pub const PROTOCOL_RANGE: std::ops::RangeInclusive<i32> = -32768..=-32000;
    pub const APPLICATION_RANGE: std::ops::RangeInclusive<i32> = -31999..=-31000;

    pub fn code(self) -> i32 {
        self.0
    }

    pub fn is_protocol(self) -> bool {
        Self::PROTOCOL_RANGE.contains(&self.0)
    }

    pub fn is_application(self) -> bool {
        Self::APPLICATION_RANGE.contains(&self.0)
    }

    /// Human-readable description of reserved codes.
    pub fn description(self) -> &'static str {
        match self {
            Self::PARSE_ERROR => "Request could not be parsed",
            Self::INVALID_REQUEST => "The request was invalid",
            Self::METHOD_NOT_FOUND => "Method not found",
            Self::INVALID_PARAMS => "Parameters do not match any overload",
            Self::INTERNAL_ERROR => "An internal error occurred",
            Self::TYPE_NOT_FOUND => "Type is not registered",
            Self::RESPONSE_PARAM_MISMATCH => "Response parameters do not match the request",
            Self::NETWORK_ERROR => "Network failure",
            Self::TIMEOUT => "The request timed out",
            code if code.is_application() => "The remote method failed",
            _ => "Unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One link of a remote cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Component that raised the error, e.g. `IService.HelloMethod`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub message: String,
    /// Best-effort trace summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(
        rename = "innerError",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub inner_error: Option<Box<ErrorData>>,
}

impl ErrorData {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            source: None,
            message: message.into(),
            trace: None,
            inner_error: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn with_inner(mut self, inner: ErrorData) -> Self {
        self.inner_error = Some(Box::new(inner));
        self
    }

    /// Builds a chain from a Rust error and its `source()` links.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut data = Self::new(error.to_string());
        if let Some(inner) = error.source() {
            data.inner_error = Some(Box::new(Self::from_error(inner)));
        }
        data
    }

    /// Iterates this link and every inner link.
    pub fn chain(&self) -> impl Iterator<Item = &ErrorData> {
        std::iter::successors(Some(self), |data| data.inner_error.as_deref())
    }
}

impl fmt::Display for ErrorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{source}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ErrorData {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner_error
            .as_deref()
            .map(|inner| inner as &(dyn std::error::Error + 'static))
    }
}

/// Error carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ErrorData>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: ErrorData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message)
    }

    pub fn type_not_found(type_name: &str) -> Self {
        Self::new(
            ErrorCode::TYPE_NOT_FOUND,
            format!("type '{type_name}' is not registered"),
        )
    }

    pub fn method_not_found(type_name: &str, method: &str) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("method '{method}' not found on type '{type_name}'"),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message)
    }

    pub fn application(message: impl Into<String>, data: ErrorData) -> Self {
        Self::new(ErrorCode::APPLICATION_ERROR, message).with_data(data)
    }

    pub fn is_application(&self) -> bool {
        self.code.is_application()
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code.description(), self.code, self.message)
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.data
            .as_ref()
            .map(|data| data as &(dyn std::error::Error + 'static))
    }
}

/// Serialized form of an internal error, used when encoding the real error
/// response fails.
pub const FALLBACK_ERROR_RESPONSE: &[u8] =
    br#"{"version":"1","error":{"code":-32603,"message":"internal error while encoding response"}}"#;

pub fn encode_request(request: &RequestEnvelope) -> ProtocolResult<Vec<u8>> {
    Ok(serde_json::to_vec(request)?)
}

/// Parses a request, rejecting unknown versions.
pub fn decode_request(data: &[u8]) -> ProtocolResult<RequestEnvelope> {
    let request: RequestEnvelope = serde_json::from_slice(data)?;
    if !request.is_compatible() {
        return Err(ProtocolError::UnsupportedVersion(request.version));
    }
    Ok(request)
}

pub fn encode_response(response: &ResponseEnvelope) -> ProtocolResult<Vec<u8>> {
    Ok(serde_json::to_vec(response)?)
}

pub fn decode_response(data: &[u8]) -> ProtocolResult<ResponseEnvelope> {
    let response: ResponseEnvelope = serde_json::from_slice(data)?;
    if response.version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(response.version));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hello_request() -> RequestEnvelope {
        RequestEnvelope::new(
            "IService",
            "HelloMethod",
            vec![
                Param::new("valueA", 1),
                Param::new("valueB", 2.0),
                Param::new("valueC", "3"),
            ],
        )
    }

    #[test]
    fn request_wire_shape() {
        let json = String::from_utf8(encode_request(&hello_request()).unwrap()).unwrap();
        insta::assert_snapshot!(json, @r#"{"version":"1","type":"IService","method":"HelloMethod","params":[{"name":"valueA","value":1},{"name":"valueB","value":2.0},{"name":"valueC","value":"3"}]}"#);
    }

    #[test]
    fn request_roundtrip() {
        let request = hello_request();
        let decoded = decode_request(&encode_request(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(
            decoded.param_names().collect::<Vec<_>>(),
            vec!["valueA", "valueB", "valueC"]
        );
    }

    #[test]
    fn request_missing_params_defaults_to_empty() {
        let decoded =
            decode_request(br#"{"version":"1","type":"T","method":"M"}"#).unwrap();
        assert!(decoded.params.is_empty());
    }

    #[test]
    fn request_with_other_version_is_rejected() {
        let result = decode_request(br#"{"version":"2","type":"T","method":"M"}"#);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(v)) if v == "2"));
    }

    #[test]
    fn success_wire_shape() {
        let response =
            ResponseEnvelope::success(Some(json!(3)), vec![Param::new("a", 1), Param::new("b", 2)]);
        let json = String::from_utf8(encode_response(&response).unwrap()).unwrap();
        insta::assert_snapshot!(json, @r#"{"version":"1","result":3,"params":[{"name":"a","value":1},{"name":"b","value":2}]}"#);

        let (result, params) = decode_response(json.as_bytes())
            .unwrap()
            .into_outcome()
            .unwrap();
        assert_eq!(result, json!(3));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn void_success_has_null_result() {
        let response = ResponseEnvelope::success(None, Vec::new());
        let json = String::from_utf8(encode_response(&response).unwrap()).unwrap();
        insta::assert_snapshot!(json, @r#"{"version":"1","result":null,"params":[]}"#);
        let (result, params) = decode_response(json.as_bytes())
            .unwrap()
            .into_outcome()
            .unwrap();
        assert_eq!(result, Value::Null);
        assert!(params.is_empty());
    }

    #[test]
    fn compact_void_success_still_decodes() {
        let (result, params) = decode_response(br#"{"version":"1"}"#)
            .unwrap()
            .into_outcome()
            .unwrap();
        assert_eq!(result, Value::Null);
        assert!(params.is_empty());
    }

    #[test]
    fn failure_wire_shape() {
        let data = ErrorData::new("boom")
            .with_source("IService.HelloMethod")
            .with_inner(ErrorData::new("disk full"));
        let response = ResponseEnvelope::failure(RpcError::application("boom", data));
        let json = String::from_utf8(encode_response(&response).unwrap()).unwrap();
        insta::assert_snapshot!(json, @r#"{"version":"1","error":{"code":-31000,"message":"boom","data":{"source":"IService.HelloMethod","message":"boom","innerError":{"message":"disk full"}}}}"#);

        let error = decode_response(json.as_bytes())
            .unwrap()
            .into_outcome()
            .unwrap_err();
        assert!(error.is_application());
        let chain: Vec<&str> = error
            .data
            .as_ref()
            .unwrap()
            .chain()
            .map(|d| d.message.as_str())
            .collect();
        assert_eq!(chain, vec!["boom", "disk full"]);
    }

    #[test]
    fn fallback_response_is_decodable() {
        let error = decode_response(FALLBACK_ERROR_RESPONSE)
            .unwrap()
            .into_outcome()
            .unwrap_err();
        assert_eq!(error.code, ErrorCode::INTERNAL_ERROR);
    }

    #[test]
    fn error_code_ranges() {
        for code in [
            ErrorCode::PARSE_ERROR,
            ErrorCode::INVALID_REQUEST,
            ErrorCode::METHOD_NOT_FOUND,
            ErrorCode::INVALID_PARAMS,
            ErrorCode::INTERNAL_ERROR,
            ErrorCode::TYPE_NOT_FOUND,
            ErrorCode::RESPONSE_PARAM_MISMATCH,
            ErrorCode::NETWORK_ERROR,
            ErrorCode::TIMEOUT,
        ] {
            assert!(code.is_protocol(), "{code}");
            assert!(!code.is_application(), "{code}");
        }
        assert!(ErrorCode::APPLICATION_ERROR.is_application());
        assert!(!ErrorCode::APPLICATION_ERROR.is_protocol());
        assert_eq!(ErrorCode(-31500).description(), "The remote method failed");
        assert_eq!(ErrorCode(7).description(), "Unknown error");
    }

    #[test]
    fn rpc_error_source_follows_chain() {
        use std::error::Error;

        let error = RpcError::application(
            "outer",
            ErrorData::new("outer").with_inner(ErrorData::new("inner")),
        );
        let first = error.source().unwrap();
        assert_eq!(first.to_string(), "outer");
        assert_eq!(first.source().unwrap().to_string(), "inner");
        assert!(first.source().unwrap().source().is_none());
        assert!(error.to_string().contains("-31000"));
    }

    #[test]
    fn error_data_from_std_error_chain() {
        #[derive(Debug)]
        struct Outer(std::io::Error);
        impl fmt::Display for Outer {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("could not save")
            }
        }
        impl std::error::Error for Outer {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let error = Outer(std::io::Error::other("disk full"));
        let data = ErrorData::from_error(&error);
        assert_eq!(data.message, "could not save");
        assert_eq!(data.inner_error.unwrap().message, "disk full");
    }
}
