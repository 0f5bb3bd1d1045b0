//! External pipeline port.
//!
//! # Data Flow
//! ```text
//! bridge adapter
//!     → Pipeline::initialize(options)    (once, until it succeeds)
//!     → Pipeline::dispatch(environment)  (per request)
//!         ↔ host function callbacks (status, headers, body writes)
//!     ← boolean-like completion value
//! ```
//!
//! # Design Decisions
//! - The adapter only sees this trait; how the foreign runtime is reached
//!   (subprocess, RPC, in-process) is an implementation detail
//! - `process.rs` ships the subprocess implementation, speaking the
//!   newline-delimited JSON protocol in `wire.rs`

pub mod process;
pub mod wire;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::bridge::environment::{EnvValue, Environment};
use crate::bridge::options::BridgeOptions;

pub use process::{PipelineConnection, ProcessConfig, ProcessPipeline};

/// Opaque identifier of an initialized pipeline instance.
#[derive(Debug, Clone, PartialEq)]
pub struct AppId(pub EnvValue);

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_json())
    }
}

impl AppId {
    pub fn new(value: impl Into<EnvValue>) -> Self {
        AppId(value.into())
    }
}

/// Errors crossing the foreign-runtime boundary.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Failed to start pipeline host: {0}")]
    Spawn(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The external pipeline reported an error.
    #[error("{message}")]
    Remote { message: String, status: Option<u16> },

    #[error("Pipeline host is closed")]
    Closed,
}

impl PipelineError {
    /// HTTP status suggested by the external side, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            PipelineError::Remote { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Io(e.to_string())
    }
}

/// The two entry points of an external middleware pipeline.
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    /// One-time setup; returns the identifier passed in every environment.
    async fn initialize(&self, options: &BridgeOptions) -> Result<AppId, PipelineError>;

    /// Handle one request. A truthy result means the response is complete;
    /// a falsy one hands the request back to the host.
    async fn dispatch(&self, env: Environment) -> Result<EnvValue, PipelineError>;
}
