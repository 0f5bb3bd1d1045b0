//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the bridge
//! host. All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::pipeline::process::{DEFAULT_RUNNER, DEFAULT_TYPE_NAME};

/// Root configuration for the bridge host.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BridgeConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Request size limits.
    pub limits: LimitsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// External pipeline settings.
    pub pipeline: PipelineConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS listener, served alongside the plain one.
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
        }
    }
}

/// TLS listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Bind address for the TLS listener (e.g., "0.0.0.0:8443").
    pub bind_address: String,

    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Whole-request timeout in seconds, including the pipeline call.
    pub request_secs: u64,

    /// Grace period for draining connections on shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 30,
            shutdown_grace_secs: 10,
        }
    }
}

/// Request size limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum buffered request body in bytes.
    pub max_body_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size: 2 * 1024 * 1024, // 2MB
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// External pipeline configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Adapter options: the assembly file name, or a table with an
    /// `assemblyFile` key plus any values to expose as `node.*`.
    /// Checked when the bridge is registered.
    pub options: serde_json::Value,

    /// Program hosting the foreign runtime.
    pub runner: String,

    /// Extra arguments placed before the native assembly path.
    pub runner_args: Vec<String>,

    /// Native bridge assembly. Falls back to `CONNECT_OWIN_NATIVE`, then the
    /// bundled default.
    pub native_assembly: Option<String>,

    /// Type exposing the `Initialize` and `Handle` entry points.
    pub type_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            options: serde_json::Value::Null,
            runner: DEFAULT_RUNNER.to_string(),
            runner_args: Vec::new(),
            native_assembly: None,
            type_name: DEFAULT_TYPE_NAME.to_string(),
        }
    }
}
