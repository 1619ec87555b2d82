//! HTTP error responses for the ingress endpoint.
//!
//! Every failure reaches the caller as a status code plus an
//! [`ErrorEnvelope`] `{code, error}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use botmesh_types::{ErrorEnvelope, ProxyError};

/// Status code paired with a JSON error body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorEnvelope,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, error: &ProxyError) -> Self {
        Self {
            status,
            body: ErrorEnvelope {
                code: code.to_string(),
                error: error.detail().to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        match &err {
            ProxyError::MalformedRequest(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "MALFORMED_REQUEST", &err)
            }
            // Pass-through failures keep the historical 404 + "ERROR" shape.
            ProxyError::Transport(_) => ApiError::new(StatusCode::NOT_FOUND, "ERROR", &err),
            ProxyError::BrokerSubscribe(_)
            | ProxyError::BrokerUnreachable(_)
            | ProxyError::Channel(_) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "BROKER_UNAVAILABLE", &err)
            }
            ProxyError::Startup(_) | ProxyError::Config(_) | ProxyError::Registry(_) => {
                tracing::error!(error = %err, "unexpected proxy error on request path");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", &err)
            }
        }
    }
}
