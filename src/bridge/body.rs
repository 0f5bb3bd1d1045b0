//! Body collector.
//!
//! Guarantees the request payload is fully in memory before the bridge runs.
//! The result is stored as a `RequestBody` request extension and the buffered
//! bytes are re-attached as the request body, so host handlers that run after
//! the pipeline declines a request still see the payload.

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::http::{HeaderMap, Request};
use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;

use crate::bridge::environment::EnvValue;
use crate::bridge::error::BridgeError;

/// The request body as seen by the bridge.
///
/// Upstream middleware may insert one (for example a parsed JSON object) to
/// skip buffering.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestBody(pub EnvValue);

/// A body is expected when `transfer-encoding` is present or
/// `content-length` is present and not `"0"`.
pub fn expects_body(headers: &HeaderMap) -> bool {
    headers.contains_key(TRANSFER_ENCODING)
        || headers
            .get(CONTENT_LENGTH)
            .is_some_and(|len| len.as_bytes() != b"0")
}

/// Buffer the request body into a `RequestBody` extension.
pub async fn collect_body(request: Request<Body>, limit: usize) -> Result<Request<Body>, BridgeError> {
    if let Some(RequestBody(current)) = request.extensions().get::<RequestBody>() {
        if current.is_truthy() {
            tracing::debug!(kind = current.kind(), "Request body already present");
            return Ok(request);
        }
    }

    let (mut parts, body) = request.into_parts();

    if !expects_body(&parts.headers) {
        parts.extensions.insert(RequestBody(EnvValue::Bytes(Bytes::new())));
        tracing::debug!("No request body expected, using empty body");
        return Ok(Request::from_parts(parts, body));
    }

    let bytes = read_chunks(body, limit).await?;
    tracing::debug!(length = bytes.len(), "Request body buffered");

    parts.extensions.insert(RequestBody(EnvValue::Bytes(bytes.clone())));
    Ok(Request::from_parts(parts, Body::from(bytes)))
}

/// Concatenate data frames in arrival order.
async fn read_chunks(mut body: Body, limit: usize) -> Result<Bytes, BridgeError> {
    let mut buffer = BytesMut::new();

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| BridgeError::BodyRead(e.to_string()))?;
        if let Ok(data) = frame.into_data() {
            if buffer.len() + data.len() > limit {
                return Err(BridgeError::BodyTooLarge { limit });
            }
            buffer.extend_from_slice(&data);
        }
    }

    Ok(buffer.freeze())
}
