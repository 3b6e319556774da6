//! Gateway error types and their HTTP mapping.

use axum::http::StatusCode;
use hermes_state::{LoadBalancerType, StateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no route matches path {0}")]
    NoRoute(String),

    #[error("no targets available for route {0}")]
    NoTargets(String),

    #[error("invalid target URL {target}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("unsupported load balancer type: {0}")]
    UnsupportedBalancer(LoadBalancerType),

    #[error("upstream request to {target} failed: {reason}")]
    Upstream { target: String, reason: String },

    #[error("upstream {0} did not respond in time")]
    UpstreamTimeout(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl GatewayError {
    /// Status code and body returned to the client.
    pub fn response_parts(&self) -> (StatusCode, &'static str) {
        match self {
            GatewayError::NoRoute(_) => (StatusCode::NOT_FOUND, "route not found"),
            GatewayError::NoTargets(_)
            | GatewayError::InvalidTarget { .. }
            | GatewayError::UnsupportedBalancer(_)
            | GatewayError::State(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "failed to route request")
            }
            GatewayError::Upstream { .. } => (StatusCode::BAD_GATEWAY, "upstream request failed"),
            GatewayError::UpstreamTimeout(_) => {
                (StatusCode::GATEWAY_TIMEOUT, "upstream request timed out")
            }
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
