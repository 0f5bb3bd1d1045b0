//! Newline-delimited JSON protocol spoken with the pipeline host process.
//!
//! # Frames
//! ```text
//! host → runtime   initialize | handle            (start call `id`)
//! runtime → host   callback {seq, function, arg}  (run a host function)
//! host → runtime   callbackResult | callbackError (answer `seq`)
//! runtime → host   result | error                 (finish call `id`)
//! ```
//!
//! # Value Encoding
//! Plain JSON, except byte buffers travel as `{"$bytes": "<base64>"}` and
//! host functions as `{"$function": n}`, where `n` indexes the function table
//! of the call that carried them.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bridge::environment::{EnvValue, HostFn};

pub const BYTES_TAG: &str = "$bytes";
pub const FUNCTION_TAG: &str = "$function";

/// Frames written by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostFrame {
    Initialize {
        id: u64,
        #[serde(rename = "typeName")]
        type_name: String,
        #[serde(rename = "methodName")]
        method_name: String,
        payload: Value,
    },
    Handle {
        id: u64,
        #[serde(rename = "typeName")]
        type_name: String,
        #[serde(rename = "methodName")]
        method_name: String,
        payload: Value,
    },
    CallbackResult {
        id: u64,
        seq: u64,
        result: Value,
    },
    CallbackError {
        id: u64,
        seq: u64,
        message: String,
    },
}

/// Frames written by the pipeline host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuntimeFrame {
    #[serde(rename = "callback")]
    Callback {
        id: u64,
        seq: u64,
        function: usize,
        #[serde(default)]
        arg: Value,
    },
    #[serde(rename = "result")]
    Completed {
        id: u64,
        #[serde(default)]
        value: Value,
    },
    #[serde(rename = "error")]
    Failed {
        id: u64,
        message: String,
        #[serde(default)]
        status: Option<u16>,
    },
}

impl RuntimeFrame {
    pub fn id(&self) -> u64 {
        match self {
            RuntimeFrame::Callback { id, .. }
            | RuntimeFrame::Completed { id, .. }
            | RuntimeFrame::Failed { id, .. } => *id,
        }
    }
}

/// Serialize a frame as one protocol line.
pub fn to_line<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

/// Host functions referenced by a single call.
#[derive(Debug, Default)]
pub struct FunctionTable {
    functions: Vec<HostFn>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: usize) -> Option<&HostFn> {
        self.functions.get(index)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Encode a value, registering any functions it contains.
    pub fn encode(&mut self, value: &EnvValue) -> Value {
        match value {
            EnvValue::Null => Value::Null,
            EnvValue::Bool(b) => Value::Bool(*b),
            EnvValue::Number(n) => Value::Number(n.clone()),
            EnvValue::String(s) => Value::String(s.clone()),
            EnvValue::Bytes(b) => tagged(BYTES_TAG, Value::String(STANDARD.encode(b))),
            EnvValue::List(items) => Value::Array(items.iter().map(|v| self.encode(v)).collect()),
            EnvValue::Map(map) => {
                Value::Object(map.iter().map(|(k, v)| (k.clone(), self.encode(v))).collect())
            }
            EnvValue::Function(f) => {
                self.functions.push(f.clone());
                tagged(FUNCTION_TAG, Value::from(self.functions.len() - 1))
            }
        }
    }
}

fn tagged(tag: &str, value: Value) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(tag.to_string(), value);
    Value::Object(map)
}

/// Decode a value received from the pipeline host.
///
/// Function references from the remote side are not callable here and decode
/// to `Null`.
pub fn decode(value: Value) -> EnvValue {
    match value {
        Value::Array(items) => EnvValue::List(items.into_iter().map(decode).collect()),
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(encoded)) = map.get(BYTES_TAG) {
                    if let Ok(raw) = STANDARD.decode(encoded) {
                        return EnvValue::Bytes(Bytes::from(raw));
                    }
                }
                if map.contains_key(FUNCTION_TAG) {
                    return EnvValue::Null;
                }
            }
            EnvValue::Map(map.into_iter().map(|(k, v)| (k, decode(v))).collect())
        }
        other => EnvValue::from(other),
    }
}
