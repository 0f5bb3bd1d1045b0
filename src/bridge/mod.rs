//! Bridge between the host router and an external request pipeline.
//!
//! # Data Flow
//! ```text
//! HTTP request
//!     → body.rs (buffer payload into RequestBody)
//!     → adapter.rs (lazy init, environment, dispatch)
//!     → environment.rs (owin.* keys, node.* passthrough, callbacks)
//!     → response.rs (callbacks mutate the buffered response)
//!     → complete response, or continue with the host chain
//! ```
//!
//! # Design Decisions
//! - The environment is a plain string-keyed map so the same shape can be
//!   handed to any `Pipeline` implementation
//! - Response mutations are buffered and only sent once the pipeline call
//!   returns a truthy result

pub mod adapter;
pub mod body;
pub mod environment;
pub mod error;
pub mod options;
pub mod response;

pub use adapter::{owin_middleware, OwinBridge, Outcome, DEFAULT_BODY_LIMIT};
pub use body::RequestBody;
pub use environment::{keys, EnvValue, Environment, HostFn, HostFnError, PipelineExtensions};
pub use error::BridgeError;
pub use options::BridgeOptions;
pub use response::{ResponseCallbacks, ResponseHandle};
