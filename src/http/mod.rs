//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, listeners, shutdown)
//!     → request.rs (request ID, connection info)
//!     → bridge middleware
//!     → host handlers (404 fallback by default)
//! ```

pub mod request;
pub mod server;

pub use request::{ConnectionInfo, RequestIdExt, X_REQUEST_ID};
pub use server::HttpServer;
