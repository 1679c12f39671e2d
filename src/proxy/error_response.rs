//! Unified error response handling for the relay
//!
//! Every handler and middleware error is rendered through this module so
//! clients always see the same JSON body with the request ID attached.

use crate::proxy::types::{ProxyError, REQUEST_ID_HEADER};
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

tokio::task_local! {
    /// Request ID of the request being handled on this task
    static REQUEST_ID: String;
}

/// Run `future` with `request_id` attached to any error it renders
pub async fn with_request_scope<F: Future>(request_id: String, future: F) -> F::Output {
    REQUEST_ID.scope(request_id, future).await
}

fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

/// Whole seconds to advertise for a retry hint, never under one
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    (retry_after.as_secs_f64().ceil() as u64).max(1)
}

/// Standard error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Unique error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Request ID for correlation
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            request_id: None,
            details: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Convert to HTTP response with proper headers
    pub fn into_response_with_status(self, status: StatusCode) -> Response {
        let request_id = self.request_id.clone();
        let mut response = (status, Json(self)).into_response();

        if let Some(id) = request_id {
            if let Ok(header_value) = HeaderValue::from_str(&id) {
                response
                    .headers_mut()
                    .insert(REQUEST_ID_HEADER, header_value);
            }
        }

        response
    }
}

/// Extension trait for consistent error formatting
pub trait ErrorResponseExt {
    /// Convert to standardized error response
    fn to_error_response(&self) -> ErrorResponse;

    /// Get the appropriate HTTP status code
    fn status_code(&self) -> StatusCode;
}

impl ErrorResponseExt for ProxyError {
    fn to_error_response(&self) -> ErrorResponse {
        use ProxyError::*;

        match self {
            InvalidInput(msg) => ErrorResponse::new("INVALID_INPUT", msg.clone()),
            DestinationRejected(msg) => ErrorResponse::new(
                "DESTINATION_REJECTED",
                format!("Destination not allowed: {msg}"),
            ),
            StreamNotFound(url) => {
                ErrorResponse::new("STREAM_NOT_FOUND", format!("No playable stream for {url}"))
            }
            RateLimited { retry_after } => {
                ErrorResponse::new("RATE_LIMITED", "Too many requests").with_details(
                    serde_json::json!({ "retryAfterSeconds": retry_after_secs(*retry_after) }),
                )
            }
            QueueTimeout(waited) => ErrorResponse::new(
                "QUEUE_TIMEOUT",
                format!("Timed out after {}s waiting for this stream", waited.as_secs()),
            ),
            CircuitOpen { retry_after } => {
                ErrorResponse::new("SERVICE_UNAVAILABLE", "Upstream temporarily unavailable")
                    .with_details(
                        serde_json::json!({ "retryAfterSeconds": retry_after_secs(*retry_after) }),
                    )
            }
            Upstream(msg) => ErrorResponse::new("UPSTREAM_ERROR", msg.clone()),
            UpstreamStatus(code) => ErrorResponse::new(
                "UPSTREAM_STATUS",
                format!("Upstream returned status {code}"),
            ),
            Unauthorized => ErrorResponse::new("UNAUTHORIZED", "Authentication required"),
            Internal(msg) => ErrorResponse::new("INTERNAL_ERROR", msg.clone()),
        }
    }

    fn status_code(&self) -> StatusCode {
        use ProxyError::*;

        match self {
            InvalidInput(_) | DestinationRejected(_) => StatusCode::BAD_REQUEST,
            StreamNotFound(_) => StatusCode::NOT_FOUND,
            RateLimited { .. } | QueueTimeout(_) => StatusCode::TOO_MANY_REQUESTS,
            CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Upstream(_) | UpstreamStatus(_) => StatusCode::BAD_GATEWAY,
            Unauthorized => StatusCode::UNAUTHORIZED,
            Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error conversion for Axum responses using standardized format
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = self.to_error_response();
        if let Some(request_id) = current_request_id() {
            body = body.with_request_id(request_id);
        }
        let mut response = body.into_response_with_status(status);

        if let Some(retry_after) = self.retry_after() {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs(retry_after)),
            );
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_error_response_with_request_id() {
        let error = ErrorResponse::new("TEST_ERROR", "Test error").with_request_id("req-123");
        assert_eq!(error.request_id, Some("req-123".to_string()));
    }

    #[rstest]
    #[case(ProxyError::InvalidInput("x".into()), StatusCode::BAD_REQUEST)]
    #[case(ProxyError::DestinationRejected("x".into()), StatusCode::BAD_REQUEST)]
    #[case(ProxyError::StreamNotFound("x".into()), StatusCode::NOT_FOUND)]
    #[case(ProxyError::RateLimited { retry_after: Duration::from_secs(1) }, StatusCode::TOO_MANY_REQUESTS)]
    #[case(ProxyError::QueueTimeout(Duration::from_secs(10)), StatusCode::TOO_MANY_REQUESTS)]
    #[case(ProxyError::CircuitOpen { retry_after: Duration::from_secs(30) }, StatusCode::SERVICE_UNAVAILABLE)]
    #[case(ProxyError::Upstream("reset".into()), StatusCode::BAD_GATEWAY)]
    #[case(ProxyError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR)]
    fn test_status_mapping(#[case] error: ProxyError, #[case] expected: StatusCode) {
        assert_eq!(error.status_code(), expected);
    }

    #[test]
    fn test_capacity_errors_carry_retry_after() {
        let response = ProxyError::CircuitOpen {
            retry_after: Duration::from_secs(12),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "12");
    }

    #[rstest]
    #[case(Duration::from_millis(200), 1)]
    #[case(Duration::from_millis(1500), 2)]
    #[case(Duration::from_millis(1900), 2)]
    #[case(Duration::from_secs(3), 3)]
    fn test_retry_hint_rounds_up_to_whole_seconds(#[case] hint: Duration, #[case] expected: u64) {
        assert_eq!(retry_after_secs(hint), expected);

        let response = ProxyError::RateLimited { retry_after: hint }.into_response();
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &expected.to_string()
        );
    }

    #[tokio::test]
    async fn test_errors_in_request_scope_carry_request_id() {
        let response = with_request_scope("req-123".to_string(), async {
            ProxyError::Unauthorized.into_response()
        })
        .await;

        assert_eq!(response.headers().get(REQUEST_ID_HEADER).unwrap(), "req-123");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["requestId"], "req-123");
        assert_eq!(json["code"], "UNAUTHORIZED");
    }

    #[test]
    fn test_errors_outside_request_scope_have_no_request_id() {
        let response = ProxyError::Unauthorized.into_response();
        assert!(response.headers().get(REQUEST_ID_HEADER).is_none());
    }
}
