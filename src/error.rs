//! Error types for the remote seams.
//!
//! Every failure here is scoped to one unit of work: the reconciler logs
//! it and moves on, the relay turns it into an HTTP status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures talking to the Kubernetes API server.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("pod {namespace}/{name} not found")]
    PodNotFound { namespace: String, name: String },

    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),
}

/// Failures talking to the registry agent.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("registry answered {status}: {body}")]
    Status { status: u16, body: String },
}

/// Request-scoped failures of the metrics relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid node path: {0}")]
    BadPath(String),

    #[error("unreadable request body: {0}")]
    Body(String),

    #[error("invalid upstream target: {0}")]
    Target(String),

    #[error("failed to read token: {0}")]
    Token(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::BadPath(_) | RelayError::Body(_) => StatusCode::BAD_REQUEST,
            RelayError::Target(_) | RelayError::Token(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}
