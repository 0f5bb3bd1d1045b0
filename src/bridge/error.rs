//! Per-request bridge errors and their HTTP rendering.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::bridge::environment::EnvValue;
use crate::pipeline::PipelineError;

/// Errors that end processing of a single request.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Body is neither a byte buffer nor a structured object.
    #[error("Invalid body format: expected bytes or an object, got {}", .body.kind())]
    InvalidBody { body: EnvValue },

    #[error("Failed to read request body: {0}")]
    BodyRead(String),

    #[error("Request body exceeds limit of {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Pipeline initialization failed: {0}")]
    Initialization(#[source] PipelineError),

    #[error("Pipeline call failed: {0}")]
    ExternalCall(#[source] PipelineError),
}

impl BridgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::InvalidBody { .. } | BridgeError::BodyRead(_) => StatusCode::BAD_REQUEST,
            BridgeError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            BridgeError::Initialization(e) | BridgeError::ExternalCall(e) => e
                .status()
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
        }
    }

    /// Label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::InvalidBody { .. } => "invalid_body",
            BridgeError::BodyRead(_) => "body_read",
            BridgeError::BodyTooLarge { .. } => "body_too_large",
            BridgeError::Initialization(_) => "initialization",
            BridgeError::ExternalCall(_) => "external_call",
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut payload = json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });
        if let BridgeError::InvalidBody { body } = &self {
            payload["body"] = body.to_json();
        }
        (status, Json(payload)).into_response()
    }
}
