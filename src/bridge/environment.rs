//! The per-request environment handed to the external pipeline.
//!
//! # Data Model
//! - `EnvValue`: heterogeneous value (strings, byte buffers, mappings, functions)
//! - `HostFn`: async function the external side may call back into
//! - `Environment`: string-keyed map of `EnvValue`, built fresh per request
//!
//! # Design Decisions
//! - Functions are first-class values so host-level and per-request
//!   capabilities travel through the same map as request metadata
//! - Once dispatched, the map is owned by the pipeline; the only channel back
//!   into the host is through the embedded functions

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};

/// Well-known environment keys.
pub mod keys {
    pub const APP_ID: &str = "connect-owin.appId";
    pub const REQUEST_METHOD: &str = "owin.RequestMethod";
    pub const REQUEST_PATH: &str = "owin.RequestPath";
    pub const REQUEST_PATH_BASE: &str = "owin.RequestPathBase";
    pub const REQUEST_PROTOCOL: &str = "owin.RequestProtocol";
    pub const REQUEST_QUERY_STRING: &str = "owin.RequestQueryString";
    pub const REQUEST_SCHEME: &str = "owin.RequestScheme";
    pub const REQUEST_HEADERS: &str = "owin.RequestHeaders";
    pub const REQUEST_BODY: &str = "owin.RequestBody";

    pub const SET_STATUS: &str = "connect-owin.setStatusCodeFunc";
    pub const SET_HEADERS: &str = "connect-owin.setHeaderFunc";
    pub const REMOVE_HEADER: &str = "connect-owin.removeHeaderFunc";
    pub const REMOVE_ALL_HEADERS: &str = "connect-owin.removeAllHeadersFunc";
    pub const WRITE: &str = "connect-owin.writeFunc";

    /// Prefix for host options and per-request extension data.
    pub const HOST_PREFIX: &str = "node.";
}

/// Error returned by a host function.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct HostFnError(pub String);

type BoxedHostFn = dyn Fn(EnvValue) -> BoxFuture<'static, Result<EnvValue, HostFnError>> + Send + Sync;

/// An async host function exposed to the external pipeline.
///
/// Cloning is cheap; clones share the same underlying closure.
#[derive(Clone)]
pub struct HostFn(Arc<BoxedHostFn>);

impl HostFn {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(EnvValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<EnvValue, HostFnError>> + Send + 'static,
    {
        Self(Arc::new(move |arg: EnvValue| f(arg).boxed()))
    }

    /// Invoke the function and wait for its completion signal.
    pub async fn call(&self, arg: EnvValue) -> Result<EnvValue, HostFnError> {
        (self.0)(arg).await
    }
}

impl fmt::Debug for HostFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostFn(..)")
    }
}

impl PartialEq for HostFn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A value stored in the environment.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EnvValue {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Bytes(Bytes),
    List(Vec<EnvValue>),
    Map(BTreeMap<String, EnvValue>),
    Function(HostFn),
}

impl EnvValue {
    /// Truthiness as the external runtime sees it: `null`, `false`, `0`, and
    /// the empty string are falsy; everything else (including empty buffers,
    /// lists, and maps) is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            EnvValue::Null => false,
            EnvValue::Bool(b) => *b,
            EnvValue::Number(n) => n.as_f64().is_some_and(|v| v != 0.0 && !v.is_nan()),
            EnvValue::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Maps and lists count as structured objects.
    pub fn is_object(&self) -> bool {
        matches!(self, EnvValue::Map(_) | EnvValue::List(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            EnvValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            EnvValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, EnvValue>> {
        match self {
            EnvValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&HostFn> {
        match self {
            EnvValue::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Short type name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            EnvValue::Null => "null",
            EnvValue::Bool(_) => "bool",
            EnvValue::Number(_) => "number",
            EnvValue::String(_) => "string",
            EnvValue::Bytes(_) => "bytes",
            EnvValue::List(_) => "list",
            EnvValue::Map(_) => "map",
            EnvValue::Function(_) => "function",
        }
    }

    /// Plain JSON rendering.
    ///
    /// Byte buffers become base64 strings. Functions are dropped from maps
    /// and become `null` inside lists.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;

        match self {
            EnvValue::Null | EnvValue::Function(_) => Value::Null,
            EnvValue::Bool(b) => Value::Bool(*b),
            EnvValue::Number(n) => Value::Number(n.clone()),
            EnvValue::String(s) => Value::String(s.clone()),
            EnvValue::Bytes(b) => Value::String(STANDARD.encode(b)),
            EnvValue::List(items) => Value::Array(items.iter().map(EnvValue::to_json).collect()),
            EnvValue::Map(map) => Value::Object(
                map.iter()
                    .filter(|(_, v)| !matches!(v, EnvValue::Function(_)))
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for EnvValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => EnvValue::Null,
            Value::Bool(b) => EnvValue::Bool(b),
            Value::Number(n) => EnvValue::Number(n),
            Value::String(s) => EnvValue::String(s),
            Value::Array(items) => EnvValue::List(items.into_iter().map(EnvValue::from).collect()),
            Value::Object(map) => {
                EnvValue::Map(map.into_iter().map(|(k, v)| (k, EnvValue::from(v))).collect())
            }
        }
    }
}

impl From<&str> for EnvValue {
    fn from(s: &str) -> Self {
        EnvValue::String(s.to_string())
    }
}

impl From<String> for EnvValue {
    fn from(s: String) -> Self {
        EnvValue::String(s)
    }
}

impl From<bool> for EnvValue {
    fn from(b: bool) -> Self {
        EnvValue::Bool(b)
    }
}

impl From<i64> for EnvValue {
    fn from(n: i64) -> Self {
        EnvValue::Number(n.into())
    }
}

impl From<u64> for EnvValue {
    fn from(n: u64) -> Self {
        EnvValue::Number(n.into())
    }
}

impl From<Bytes> for EnvValue {
    fn from(b: Bytes) -> Self {
        EnvValue::Bytes(b)
    }
}

impl From<Vec<u8>> for EnvValue {
    fn from(b: Vec<u8>) -> Self {
        EnvValue::Bytes(Bytes::from(b))
    }
}

impl From<HostFn> for EnvValue {
    fn from(f: HostFn) -> Self {
        EnvValue::Function(f)
    }
}

impl From<BTreeMap<String, EnvValue>> for EnvValue {
    fn from(map: BTreeMap<String, EnvValue>) -> Self {
        EnvValue::Map(map)
    }
}

/// Per-request data that upstream host middleware attaches to a request
/// for the external pipeline.
///
/// Entries are merged into the environment under the `node.` prefix.
#[derive(Debug, Clone, Default)]
pub struct PipelineExtensions(pub BTreeMap<String, EnvValue>);

impl PipelineExtensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<EnvValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

/// String-keyed environment passed to the external pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    entries: BTreeMap<String, EnvValue>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<EnvValue>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&EnvValue> {
        self.entries.get(key)
    }

    /// Look up an embedded function by key.
    pub fn function(&self, key: &str) -> Option<&HostFn> {
        self.get(key).and_then(EnvValue::as_function)
    }

    /// Insert every entry as `prefix + key`.
    pub fn merge_prefixed<'a, I>(&mut self, prefix: &str, entries: I)
    where
        I: IntoIterator<Item = (&'a String, &'a EnvValue)>,
    {
        for (key, value) in entries {
            self.entries.insert(format!("{prefix}{key}"), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EnvValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Convert into a map value for transport.
    pub fn into_value(self) -> EnvValue {
        EnvValue::Map(self.entries)
    }
}
