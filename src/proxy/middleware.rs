//! Middleware implementations for the relay service

use crate::admission::RateLimiter;
use crate::proxy::error_response::with_request_scope;
use crate::proxy::headers::paths::HEALTH;
use crate::proxy::types::*;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Identity used for callers whose peer address is unavailable
const UNKNOWN_CALLER: &str = "unknown";

fn default_bypass_paths() -> HashSet<BypassPath> {
    BypassPath::try_new(HEALTH).into_iter().collect()
}

/// Configuration for authentication middleware
///
/// With no API keys configured every request is admitted.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Valid API keys
    pub api_keys: HashSet<ApiKey>,
    /// Paths that bypass authentication
    pub bypass_paths: HashSet<BypassPath>,
}

impl AuthConfig {
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            api_keys: keys
                .into_iter()
                .filter_map(|key| ApiKey::try_new(key.into()).ok())
                .collect(),
            ..Self::default()
        }
    }

    pub fn is_open(&self) -> bool {
        self.api_keys.is_empty()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_keys: HashSet::new(),
            bypass_paths: default_bypass_paths(),
        }
    }
}

/// State for the rate limiting middleware
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub limiter: Arc<RateLimiter>,
    /// Paths that are never rate limited
    pub bypass_paths: HashSet<BypassPath>,
}

impl RateLimitConfig {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            bypass_paths: default_bypass_paths(),
        }
    }
}

fn is_bypassed(bypass_paths: &HashSet<BypassPath>, path: &str) -> bool {
    BypassPath::try_new(path).is_ok_and(|path| bypass_paths.contains(&path))
}

fn new_request_id() -> Option<HeaderValue> {
    HeaderValue::from_str(&Uuid::now_v7().to_string()).ok()
}

/// Request ID middleware - ensures every request has a unique ID for tracing
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .and_then(|uuid| HeaderValue::from_str(&uuid.to_string()).ok())
        .or_else(new_request_id);

    let Some(request_id) = request_id else {
        return next.run(request).await;
    };

    request
        .headers_mut()
        .insert(REQUEST_ID_HEADER, request_id.clone());

    let scope_id = request_id.to_str().unwrap_or_default().to_string();
    let mut response = with_request_scope(scope_id, next.run(request)).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, request_id);
    response
}

/// Authentication middleware - validates bearer API keys when any are configured
pub async fn auth_middleware(
    State(auth_config): State<Arc<AuthConfig>>,
    request: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    if auth_config.is_open() || is_bypassed(&auth_config.bypass_paths, request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|auth| auth.strip_prefix(BEARER_PREFIX))
        .map(str::trim);

    let Some(presented) = presented else {
        warn!("Missing or invalid Authorization header");
        return Err(ProxyError::Unauthorized);
    };

    match ApiKey::try_new(presented) {
        Ok(api_key) if auth_config.api_keys.contains(&api_key) => Ok(next.run(request).await),
        _ => {
            warn!("Invalid API key attempted");
            Err(ProxyError::Unauthorized)
        }
    }
}

/// Rate limiting middleware - one token bucket per peer address
pub async fn rate_limit_middleware(
    State(config): State<Arc<RateLimitConfig>>,
    request: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    if is_bypassed(&config.bypass_paths, request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let identity = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CALLER.to_string());

    match config.limiter.check(&identity) {
        Ok(()) => Ok(next.run(request).await),
        Err(retry_after) => {
            warn!(caller = %identity, retry_after_ms = retry_after.as_millis() as u64, "Rate limited");
            Err(ProxyError::RateLimited { retry_after })
        }
    }
}

/// Logging middleware - logs request/response details with timing
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    info!(
        request_id = request_id,
        method = %method,
        path = %path,
        "Incoming request"
    );

    let response = next.run(request).await;

    // Streamed bodies are still flowing at this point; this is time to headers
    info!(
        request_id = request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Request completed"
    );

    response
}

/// Error logging wrapper that keeps the request ID on failed responses
pub async fn error_handling_middleware(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let mut response = next.run(request).await.into_response();
    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        if status.is_server_error() {
            error!(request_id = request_id, status = status.as_u16(), "Request failed");
        } else {
            warn!(request_id = request_id, status = status.as_u16(), "Request rejected");
        }

        if let Ok(header_value) = HeaderValue::from_str(&request_id) {
            response
                .headers_mut()
                .insert(REQUEST_ID_HEADER, header_value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::middleware::{from_fn, from_fn_with_state};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn ok_handler(_req: Request) -> Result<Response, std::convert::Infallible> {
        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .unwrap())
    }

    fn request(path: &str) -> Request {
        Request::builder()
            .method("POST")
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_id_generation() {
        let handler = tower::service_fn(|req: Request| async move {
            let request_id = req
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|h| h.to_str().ok())
                .unwrap_or("missing")
                .to_string();

            Ok::<_, std::convert::Infallible>(
                Response::builder()
                    .status(StatusCode::OK)
                    .header("x-seen-request-id", request_id)
                    .body(Body::empty())
                    .unwrap(),
            )
        });

        let service = tower::ServiceBuilder::new()
            .layer(from_fn(request_id_middleware))
            .service(handler);

        let response = service.oneshot(request("/search")).await.unwrap();

        let request_id = response.headers().get(REQUEST_ID_HEADER).unwrap();
        let uuid = Uuid::parse_str(request_id.to_str().unwrap()).unwrap();
        assert_eq!(uuid.get_version_num(), 7);
        assert_eq!(response.headers().get("x-seen-request-id").unwrap(), request_id);
    }

    #[tokio::test]
    async fn test_valid_request_id_is_propagated() {
        let incoming = Uuid::now_v7().to_string();
        let service = tower::ServiceBuilder::new()
            .layer(from_fn(request_id_middleware))
            .service(tower::service_fn(ok_handler));

        let mut req = request("/search");
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, HeaderValue::from_str(&incoming).unwrap());
        let response = service.oneshot(req).await.unwrap();

        assert_eq!(response.headers().get(REQUEST_ID_HEADER).unwrap(), incoming.as_str());
    }

    #[tokio::test]
    async fn test_open_auth_admits_everyone() {
        let service = tower::ServiceBuilder::new()
            .layer(from_fn_with_state(
                Arc::new(AuthConfig::default()),
                auth_middleware,
            ))
            .service(tower::service_fn(ok_handler));

        let response = service.oneshot(request("/search")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_auth_middleware_valid_key() {
        let service = tower::ServiceBuilder::new()
            .layer(from_fn_with_state(
                Arc::new(AuthConfig::from_keys(["valid-key-123"])),
                auth_middleware,
            ))
            .service(tower::service_fn(ok_handler));

        let mut req = request("/search");
        req.headers_mut().insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer valid-key-123"),
        );
        let response = service.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_auth_middleware_invalid_key() {
        let service = tower::ServiceBuilder::new()
            .layer(from_fn_with_state(
                Arc::new(AuthConfig::from_keys(["valid-key-123"])),
                auth_middleware,
            ))
            .service(tower::service_fn(ok_handler));

        let mut req = request("/search");
        req.headers_mut().insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer invalid-key"),
        );
        let response = service.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_auth_bypass_health_check() {
        let service = tower::ServiceBuilder::new()
            .layer(from_fn_with_state(
                Arc::new(AuthConfig::from_keys(["valid-key-123"])),
                auth_middleware,
            ))
            .service(tower::service_fn(ok_handler));

        let response = service.oneshot(request(HEALTH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_rejects_excess_with_retry_after() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(60), 60, 2));
        let service = tower::ServiceBuilder::new()
            .layer(from_fn_with_state(
                Arc::new(RateLimitConfig::new(limiter)),
                rate_limit_middleware,
            ))
            .service(tower::service_fn(ok_handler));

        for _ in 0..2 {
            let response = service.clone().oneshot(request("/search")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = service.clone().oneshot(request("/search")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");

        let response = service.oneshot(request(HEALTH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
