//! Request-scoped metadata.
//!
//! # Responsibilities
//! - Name the request ID header shared by the ID layers and the logs
//! - Record whether the request arrived over an encrypted connection
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - Connection info is a request extension set by the listener, so handlers
//!   never inspect the socket

use axum::http::{HeaderName, Request};

/// Header carrying the request correlation ID.
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Transport details of the connection a request arrived on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub encrypted: bool,
}

/// Access to the request ID assigned by the ID layer.
pub trait RequestIdExt {
    fn request_id(&self) -> Option<&str>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<&str> {
        self.headers().get(X_REQUEST_ID).and_then(|v| v.to_str().ok())
    }
}
