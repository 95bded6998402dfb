//! Relay-originated error types and their HTTP representation.
//!
//! Upstream non-2xx responses and mid-stream truncation are *not*
//! represented here — those are forwarded/handled directly by the route
//! handlers and the engine. `RelayError` covers only errors the
//! relay itself raises before or instead of talking to an upstream.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("request body exceeds the configured size limit")]
    PayloadTooLarge,
    #[error("malformed request body: {0}")]
    BadRequest(String),
    #[error("no route matches this path")]
    NotFound,
    #[error("failed to connect to upstream: {0}")]
    UpstreamConnect(String),
    #[error("upstream request timed out")]
    UpstreamTimeout,
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    fn status(&self) -> StatusCode {
        match self {
            RelayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound => StatusCode::NOT_FOUND,
            RelayError::UpstreamConnect(_) => StatusCode::BAD_GATEWAY,
            RelayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            RelayError::PayloadTooLarge => "payload_too_large",
            RelayError::BadRequest(_) => "bad_request",
            RelayError::NotFound => "not_found",
            RelayError::UpstreamConnect(_) => "upstream_connect_error",
            RelayError::UpstreamTimeout => "upstream_timeout",
            RelayError::Internal(_) => "internal_error",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
    request_id: String,
}

/// Render a `RelayError` as a JSON error body, tagged with the request id
/// so clients and logs can be correlated.
pub fn error_response(err: &RelayError, request_id: &str) -> Response {
    let body = ErrorBody {
        error: ErrorDetail {
            kind: err.kind(),
            message: err.to_string(),
            request_id: request_id.to_string(),
        },
    };
    (err.status(), axum::Json(body)).into_response()
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        error_response(&self, "unknown")
    }
}
