//! Adapter-wide options.
//!
//! The options value is either a string naming the external assembly, or a
//! map with a string `assemblyFile` entry. Every entry (including
//! `assemblyFile`) is forwarded to the pipeline's initialization call and
//! copied into each request environment under the `node.` prefix, which is how
//! host-level configuration and functions reach the external side.

use std::collections::BTreeMap;

use crate::bridge::environment::{EnvValue, HostFn};
use crate::config::ConfigError;

/// Key naming the external assembly.
pub const ASSEMBLY_FILE: &str = "assemblyFile";

/// Validated adapter options.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeOptions {
    assembly_file: String,
    extra: BTreeMap<String, EnvValue>,
}

impl BridgeOptions {
    pub fn new(assembly_file: impl Into<String>) -> Self {
        Self {
            assembly_file: assembly_file.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Accept a string or a map with a string `assemblyFile`.
    pub fn from_value(value: EnvValue) -> Result<Self, ConfigError> {
        match value {
            EnvValue::String(assembly_file) => Ok(Self::new(assembly_file)),
            EnvValue::Map(mut map) => {
                let assembly_file = match map.remove(ASSEMBLY_FILE) {
                    Some(EnvValue::String(s)) => s,
                    _ => return Err(ConfigError::MissingAssemblyFile),
                };
                Ok(Self {
                    assembly_file,
                    extra: map,
                })
            }
            other => Err(ConfigError::UnsupportedOptions { found: other.kind() }),
        }
    }

    /// Add an extra entry. The `assemblyFile` key cannot be replaced this way.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<EnvValue>) -> Self {
        let key = key.into();
        if key != ASSEMBLY_FILE {
            self.extra.insert(key, value.into());
        }
        self
    }

    /// Export a host function to the pipeline as `node.<key>`.
    pub fn with_function(self, key: impl Into<String>, f: HostFn) -> Self {
        self.with(key, EnvValue::Function(f))
    }

    pub fn assembly_file(&self) -> &str {
        &self.assembly_file
    }

    pub fn get(&self, key: &str) -> Option<&EnvValue> {
        self.extra.get(key)
    }

    /// All entries as a map, `assemblyFile` included.
    pub fn to_map(&self) -> BTreeMap<String, EnvValue> {
        let mut map = self.extra.clone();
        map.insert(ASSEMBLY_FILE.to_string(), EnvValue::String(self.assembly_file.clone()));
        map
    }

    /// The options as sent to the initialization call.
    pub fn to_value(&self) -> EnvValue {
        EnvValue::Map(self.to_map())
    }
}

impl TryFrom<serde_json::Value> for BridgeOptions {
    type Error = ConfigError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        Self::from_value(EnvValue::from(value))
    }
}

impl TryFrom<&str> for BridgeOptions {
    type Error = ConfigError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(Self::new(value))
    }
}
