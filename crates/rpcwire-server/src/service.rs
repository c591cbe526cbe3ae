//! Services exposed to the remote peer.
//!
//! A [`Service`] is a named table of [`MethodEntry`] overloads. Handlers are
//! plain closures over whatever instance backs the service; they receive the
//! call's [`Arguments`] and may write back `out`/`ref` parameters.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use rpcwire_protocol::{ErrorData, Param};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// How a parameter travels between caller and callee.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamDirection {
    /// Sent to the callee only.
    #[default]
    In,
    /// Filled in by the callee; sent as null.
    Out,
    /// Sent to the callee and written back.
    Ref,
}

/// One declared parameter of a method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default)]
    pub direction: ParamDirection,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, direction: ParamDirection) -> Self {
        Self {
            name: name.into(),
            alias: None,
            direction,
        }
    }

    /// An input parameter.
    pub fn input(name: impl Into<String>) -> Self {
        Self::new(name, ParamDirection::In)
    }

    /// An output parameter.
    pub fn output(name: impl Into<String>) -> Self {
        Self::new(name, ParamDirection::Out)
    }

    /// A by-reference parameter.
    pub fn by_ref(name: impl Into<String>) -> Self {
        Self::new(name, ParamDirection::Ref)
    }

    /// Builder: name used on the wire instead of `name`.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Name sent on the wire.
    pub fn wire_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// True if the caller's value is delivered to the callee.
    pub fn sends_value(&self) -> bool {
        self.direction != ParamDirection::Out
    }

    /// True if the callee's final value is written back to the caller.
    pub fn receives_value(&self) -> bool {
        self.direction != ParamDirection::In
    }
}

/// Failure raised by a service handler.
#[derive(Debug, Clone, Error)]
pub enum ServiceFault {
    /// An argument could not be converted to the handler's type.
    #[error("invalid argument '{name}' at position {position}: {reason}")]
    InvalidArgument {
        position: usize,
        name: String,
        reason: String,
    },

    /// The operation itself failed.
    #[error("{message}")]
    Failed {
        message: String,
        component: Option<String>,
        trace: Option<String>,
        cause: Option<ErrorData>,
    },
}

impl ServiceFault {
    /// Creates an application failure with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            component: None,
            trace: capture_trace(),
            cause: None,
        }
    }

    /// Wraps an error, keeping its `source()` chain as the cause.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        Self::Failed {
            message: error.to_string(),
            component: None,
            trace: capture_trace(),
            cause: error.source().map(ErrorData::from_error),
        }
    }

    /// Builder: name the component that failed.
    pub fn with_component(mut self, name: impl Into<String>) -> Self {
        if let Self::Failed { component, .. } = &mut self {
            *component = Some(name.into());
        }
        self
    }

    /// Builder: attach an underlying cause.
    pub fn with_cause(mut self, error: ErrorData) -> Self {
        if let Self::Failed { cause, .. } = &mut self {
            *cause = Some(error);
        }
        self
    }

    /// Converts to the error data sent to the caller.
    ///
    /// `default_source` names the failing component when the handler did not.
    pub fn to_error_data(&self, default_source: &str) -> ErrorData {
        match self {
            Self::InvalidArgument { .. } => {
                ErrorData::new(self.to_string()).with_source(default_source)
            }
            Self::Failed {
                message,
                component,
                trace,
                cause,
            } => {
                let mut data = ErrorData::new(message.clone())
                    .with_source(component.as_deref().unwrap_or(default_source));
                if let Some(trace) = trace {
                    data = data.with_trace(trace.clone());
                }
                if let Some(cause) = cause {
                    data = data.with_inner(cause.clone());
                }
                data
            }
        }
    }
}

fn capture_trace() -> Option<String> {
    let trace = std::backtrace::Backtrace::capture();
    match trace.status() {
        std::backtrace::BacktraceStatus::Captured => Some(trace.to_string()),
        _ => None,
    }
}

/// Positional argument values of one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    names: Vec<String>,
    values: Vec<Value>,
}

impl Arguments {
    pub fn new(params: Vec<Param>) -> Self {
        let (names, values) = params.into_iter().map(|p| (p.name, p.value)).unzip();
        Self { names, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value at `index`.
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Converts the value at `index` to `T`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, ServiceFault> {
        let value = self.values.get(index).ok_or_else(|| self.invalid(index, "missing"))?;
        T::deserialize(value).map_err(|e| self.invalid(index, e.to_string()))
    }

    /// Replaces the value at `index`, for `out` and `ref` parameters.
    pub fn set<T: Serialize>(&mut self, index: usize, value: T) -> Result<(), ServiceFault> {
        let value = serde_json::to_value(value).map_err(|e| self.invalid(index, e.to_string()))?;
        match self.values.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(self.invalid(index, "missing")),
        }
    }

    /// Final parameter list, echoed back to the caller.
    pub fn into_params(self) -> Vec<Param> {
        self.names
            .into_iter()
            .zip(self.values)
            .map(|(name, value)| Param { name, value })
            .collect()
    }

    fn invalid(&self, position: usize, reason: impl Into<String>) -> ServiceFault {
        ServiceFault::InvalidArgument {
            position,
            name: self.names.get(position).cloned().unwrap_or_default(),
            reason: reason.into(),
        }
    }
}

/// Handler invoked for one method overload.
pub type MethodHandler = Arc<dyn Fn(&mut Arguments) -> Result<Value, ServiceFault> + Send + Sync>;

/// One callable overload.
#[derive(Clone)]
pub struct MethodEntry {
    name: String,
    alias: Option<String>,
    params: Vec<ParamSpec>,
    returns_value: bool,
    handler: MethodHandler,
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodEntry")
            .field("name", &self.name)
            .field("alias", &self.alias)
            .field("params", &self.params)
            .field("returns_value", &self.returns_value)
            .finish_non_exhaustive()
    }
}

impl MethodEntry {
    pub fn new<F>(name: impl Into<String>, params: Vec<ParamSpec>, handler: F) -> Self
    where
        F: Fn(&mut Arguments) -> Result<Value, ServiceFault> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            alias: None,
            params,
            returns_value: true,
            handler: Arc::new(handler),
        }
    }

    /// Builder: name used on the wire instead of `name`.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Builder: the method returns nothing; its result is omitted.
    pub fn void(mut self) -> Self {
        self.returns_value = false;
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

    pub fn returns_value(&self) -> bool {
        self.returns_value
    }

    /// Runs the handler.
    pub fn invoke(&self, args: &mut Arguments) -> Result<Value, ServiceFault> {
        (self.handler)(args)
    }

    /// Checks positional parameter names.
    ///
    /// Returns the first mismatched position, or the declared count when the
    /// counts differ.
    pub fn check_params<'a>(&self, names: impl ExactSizeIterator<Item = &'a str>) -> Result<(), usize> {
        if names.len() != self.params.len() {
            return Err(self.params.len());
        }
        match self
            .params
            .iter()
            .zip(names)
            .position(|(spec, name)| spec.wire_name() != name)
        {
            Some(position) => Err(position),
            None => Ok(()),
        }
    }
}

/// A named set of methods backed by one instance.
#[derive(Debug, Clone)]
pub struct Service {
    name: String,
    alias: Option<String>,
    methods: HashMap<String, Vec<MethodEntry>>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            methods: HashMap::new(),
        }
    }

    /// Builder: name used on the wire instead of `name`.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Builder: add a method overload.
    pub fn method(mut self, entry: MethodEntry) -> Self {
        self.methods
            .entry(entry.wire_name().to_string())
            .or_default()
            .push(entry);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wire_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// All overloads published under `method`.
    pub fn overloads(&self, method: &str) -> Option<&[MethodEntry]> {
        self.methods.get(method).map(Vec::as_slice)
    }

    /// Wire names of all methods.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

/// Services keyed by wire name. Shared by every connection of a peer.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service, returning the one it replaced.
    pub fn register(&self, service: Service) -> Option<Arc<Service>> {
        let name = service.wire_name().to_string();
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(service))
    }

    /// Removes a service by wire name.
    pub fn unregister(&self, name: &str) -> Option<Arc<Service>> {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Service>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Wire names of all registered services, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
