//! Forward module error types
//!
//! Defines the HTTP-facing errors the gateway returns once a request is
//! not going to be retried any further (C6 has given up, or C7 rejected it
//! outright).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Error types for the forward module. Variants map 1:1 onto the exit-code
/// table in the external interfaces: 400 invalid_request, 401
/// authentication_error, 403 billing_error, 413 request_entity_too_large,
/// 429 rate_limit_error, 502 upstream_error, 503
/// overloaded_error/service_unavailable, 504 gateway_timeout.
#[derive(Debug, Clone)]
pub enum ForwardError {
    Unauthorized(String),
    InvalidRequest(String),
    RequestEntityTooLarge(String),
    BillingError(String),
    BillingServiceUnavailable,
    RateLimited(String),
    Overloaded(String),
    UpstreamError(String),
    Timeout(String),
    Internal(String),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            ForwardError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            ForwardError::RequestEntityTooLarge(msg) => write!(f, "Request too large: {}", msg),
            ForwardError::BillingError(code) => write!(f, "Billing error: {}", code),
            ForwardError::BillingServiceUnavailable => write!(f, "Billing service unavailable"),
            ForwardError::RateLimited(msg) => write!(f, "Rate limited: {}", msg),
            ForwardError::Overloaded(msg) => write!(f, "Overloaded: {}", msg),
            ForwardError::UpstreamError(msg) => write!(f, "Upstream error: {}", msg),
            ForwardError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            ForwardError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ForwardError {}

impl ForwardError {
    /// The status/error-type/message triple every response surface (JSON
    /// body, SSE error frame) is built from.
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ForwardError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, "authentication_error", msg.clone())
            }
            ForwardError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", msg.clone())
            }
            ForwardError::RequestEntityTooLarge(msg) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "request_entity_too_large",
                msg.clone(),
            ),
            ForwardError::BillingError(code) => {
                (StatusCode::FORBIDDEN, "billing_error", code.clone())
            }
            ForwardError::BillingServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "billing_service_unavailable",
                "billing datasource unavailable".to_string(),
            ),
            ForwardError::RateLimited(msg) => {
                (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", msg.clone())
            }
            ForwardError::Overloaded(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "overloaded_error", msg.clone())
            }
            ForwardError::UpstreamError(msg) => {
                (StatusCode::BAD_GATEWAY, "upstream_error", msg.clone())
            }
            ForwardError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "gateway_timeout", msg.clone()),
            ForwardError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
        }
    }

    /// Renders this error as a mid-stream SSE frame instead of a fresh HTTP
    /// response. Used once the streaming response has already been handed
    /// to the client and the status is no longer rewritable.
    pub fn to_sse_frame(&self, protocol: crate::forward::stream::StreamProtocol) -> Vec<u8> {
        let (_, error_type, message) = self.parts();
        protocol.error_frame(error_type, &message)
    }
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = self.parts();

        crate::logger::error(
            "forward",
            &format!(
                "returning error response: status={}, type={}, message={}",
                status.as_u16(),
                error_type,
                message
            ),
        );

        (
            status,
            Json(serde_json::json!({
                "error": {
                    "type": error_type,
                    "message": message
                }
            })),
        )
            .into_response()
    }
}

pub type ForwardResult<T> = Result<T, ForwardError>;

impl From<crate::failover::FailoverError> for ForwardError {
    fn from(err: crate::failover::FailoverError) -> Self {
        match err {
            crate::failover::FailoverError::NoAvailableAccounts => {
                ForwardError::Overloaded("no schedulable account available".into())
            }
            crate::failover::FailoverError::SwitchBudgetExhausted => {
                ForwardError::UpstreamError("exhausted account switch budget".into())
            }
            crate::failover::FailoverError::FallbackGroupUnusable => {
                ForwardError::InvalidRequest("fallback group is not usable for this request".into())
            }
            crate::failover::FailoverError::Fatal(msg) => ForwardError::InvalidRequest(msg),
        }
    }
}

impl From<crate::billing::BillingDecision> for ForwardError {
    fn from(decision: crate::billing::BillingDecision) -> Self {
        match decision {
            crate::billing::BillingDecision::Denied(reason) => {
                ForwardError::BillingError(reason.code().to_string())
            }
            crate::billing::BillingDecision::Degraded => ForwardError::BillingServiceUnavailable,
            crate::billing::BillingDecision::Allowed => {
                ForwardError::Internal("billing decision was Allowed, not an error".into())
            }
        }
    }
}
