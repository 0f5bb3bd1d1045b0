//! Response handle and the callbacks that mutate it.
//!
//! # Responsibilities
//! - Hold the in-flight status, headers, and body for one request
//! - Expose set-status, set-headers, remove-header, remove-all-headers and
//!   write-body as `HostFn`s for the external pipeline
//! - Convert the final state into an axum `Response`
//!
//! # Design Decisions
//! - The body is buffered until the pipeline call returns, so an external
//!   error can discard everything written so far
//! - Callbacks never fail; arguments of the wrong shape are ignored

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};

use crate::bridge::environment::{keys, EnvValue, Environment, HostFn, HostFnError};

/// Mutable response state for a single request.
#[derive(Debug)]
pub struct ResponseHandle {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
}

impl Default for ResponseHandle {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
        }
    }
}

impl ResponseHandle {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns `false` if `code` is not a valid status.
    pub fn set_status(&mut self, code: u16) -> bool {
        match StatusCode::from_u16(code) {
            Ok(status) => {
                self.status = status;
                true
            }
            Err(_) => false,
        }
    }

    /// Replace a header. Returns `false` for an invalid name or value.
    pub fn set_header(&mut self, name: &str, value: &str) -> bool {
        let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) else {
            return false;
        };
        self.headers.insert(name, value);
        true
    }

    pub fn remove_header(&mut self, name: &str) {
        if let Ok(name) = HeaderName::try_from(name) {
            self.headers.remove(name);
        }
    }

    pub fn clear_headers(&mut self) {
        self.headers.clear();
    }

    pub fn write(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    pub fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body.freeze()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Shared handle plus the five callbacks bound to it.
#[derive(Debug, Clone, Default)]
pub struct ResponseCallbacks {
    handle: Arc<Mutex<ResponseHandle>>,
}

impl ResponseCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(handle: &Mutex<ResponseHandle>) -> MutexGuard<'_, ResponseHandle> {
        handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the handle.
    pub fn with_handle<R>(&self, f: impl FnOnce(&mut ResponseHandle) -> R) -> R {
        f(&mut Self::lock(&self.handle))
    }

    /// Bind a callback body to the shared handle.
    fn bind(&self, f: fn(&mut ResponseHandle, EnvValue)) -> HostFn {
        let handle = self.handle.clone();
        HostFn::new(move |arg| {
            f(&mut Self::lock(&handle), arg);
            async { Ok::<_, HostFnError>(EnvValue::Null) }
        })
    }

    pub fn set_status_fn(&self) -> HostFn {
        self.bind(|res, arg| {
            if let EnvValue::Number(n) = arg {
                if let Some(code) = n.as_u64().and_then(|c| u16::try_from(c).ok()) {
                    res.set_status(code);
                }
            }
        })
    }

    pub fn set_headers_fn(&self) -> HostFn {
        self.bind(|res, arg| {
            let EnvValue::Map(headers) = arg else { return };
            for (name, values) in headers {
                if let EnvValue::List(values) = values {
                    let joined = values.iter().map(header_text).collect::<Vec<_>>().join(",");
                    res.set_header(&name, &joined);
                }
            }
        })
    }

    pub fn remove_header_fn(&self) -> HostFn {
        self.bind(|res, arg| {
            if let EnvValue::String(name) = arg {
                res.remove_header(&name);
            }
        })
    }

    pub fn remove_all_headers_fn(&self) -> HostFn {
        self.bind(|res, _| res.clear_headers())
    }

    pub fn write_fn(&self) -> HostFn {
        self.bind(|res, arg| {
            if let EnvValue::Bytes(chunk) = arg {
                res.write(&chunk);
            }
        })
    }

    /// Embed all five callbacks into the environment.
    pub fn install(&self, env: &mut Environment) {
        env.insert(keys::SET_STATUS, self.set_status_fn());
        env.insert(keys::SET_HEADERS, self.set_headers_fn());
        env.insert(keys::REMOVE_HEADER, self.remove_header_fn());
        env.insert(keys::REMOVE_ALL_HEADERS, self.remove_all_headers_fn());
        env.insert(keys::WRITE, self.write_fn());
    }

    /// Take the accumulated state, leaving a fresh handle behind.
    pub fn take_response(&self) -> Response {
        std::mem::take(&mut *Self::lock(&self.handle)).into_response()
    }
}

fn header_text(value: &EnvValue) -> String {
    match value {
        EnvValue::String(s) => s.clone(),
        EnvValue::Number(n) => n.to_string(),
        EnvValue::Bool(b) => b.to_string(),
        EnvValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        _ => String::new(),
    }
}

/// Convenience for building a write argument.
pub fn chunk(data: impl Into<Bytes>) -> EnvValue {
    EnvValue::Bytes(data.into())
}
