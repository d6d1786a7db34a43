//! Gateway errors and sanitization
//!
//! Every failure a browser caller can see is a [`GatewayError`], rendered as a
//! `{"error": "..."}` JSON body (or a login redirect). Internal failures are logged in
//! full and reach the client only as a generic message.

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::relay::RelayError;

/// Failures of a gateway request, each mapped to one status code
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No valid session. HTML callers are sent to `login_redirect` when set.
    #[error("Unauthorized")]
    Unauthenticated { login_redirect: Option<String> },

    #[error("Forbidden")]
    Forbidden,

    #[error("Client not available")]
    EndpointNotFound,

    #[error("Client not available")]
    EndpointInactive,

    #[error("Client offline")]
    AgentOffline,

    #[error("Proxy timeout")]
    Timeout,

    #[error("{0}")]
    DispatchFailed(String),

    /// The agent answered with an error frame
    #[error("{0}")]
    AgentReported(String),

    #[error("Not found")]
    NotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated {
                login_redirect: Some(_),
            } => StatusCode::FOUND,
            GatewayError::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden => StatusCode::FORBIDDEN,
            GatewayError::EndpointNotFound
            | GatewayError::EndpointInactive
            | GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::AgentOffline => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::DispatchFailed(_) | GatewayError::AgentReported(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message placed in the JSON body
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Internal(e) => sanitize_error(e),
            other => other.to_string(),
        }
    }
}

impl From<RelayError> for GatewayError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::AgentOffline => GatewayError::AgentOffline,
            RelayError::Timeout => GatewayError::Timeout,
            other => GatewayError::DispatchFailed(other.to_string()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::Unauthenticated {
            login_redirect: Some(location),
        } = &self
        {
            return (StatusCode::FOUND, [(header::LOCATION, location.clone())]).into_response();
        }

        let status = self.status();
        (status, Json(json!({ "error": self.client_message() }))).into_response()
    }
}

/// Sanitize error messages for client responses
///
/// Logs the full error internally but returns a generic message to the client
/// to prevent information disclosure of internal implementation details.
///
/// # Examples
///
/// ```
/// use anyhow::anyhow;
/// use webvpn_relay::error_handling::sanitize_error;
///
/// let err = anyhow!("Failed to query DynamoDB: AccessDeniedException");
/// let sanitized = sanitize_error(&err);
/// assert_eq!(sanitized, "Internal server error");
/// ```
pub fn sanitize_error(e: &anyhow::Error) -> String {
    error!("Internal error: {:#}", e);
    "Internal server error".to_string()
}
