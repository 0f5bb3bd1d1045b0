//! Bridge that runs an external request pipeline in front of an Axum router.

pub mod bridge;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pipeline;

pub use bridge::{BridgeOptions, EnvValue, Environment, OwinBridge};
pub use config::BridgeConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use pipeline::{AppId, Pipeline, PipelineError, ProcessPipeline};
