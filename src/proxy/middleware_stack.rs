//! Middleware stack builder for clean composition

use crate::admission::RateLimiter;
use crate::proxy::middleware::*;
use axum::{
    middleware::{from_fn, from_fn_with_state},
    Router,
};
use std::sync::Arc;

/// Builder for composing the relay middleware stack
pub struct ProxyMiddlewareStack {
    auth_config: Arc<AuthConfig>,
    rate_limit: Arc<RateLimitConfig>,
}

impl ProxyMiddlewareStack {
    pub fn new(auth_config: AuthConfig, limiter: Arc<RateLimiter>) -> Self {
        Self {
            auth_config: Arc::new(auth_config),
            rate_limit: Arc::new(RateLimitConfig::new(limiter)),
        }
    }

    /// Apply the complete middleware stack to a router
    ///
    /// Outer to inner: request ID, logging, error handling, authentication,
    /// rate limiting. Rejections from the inner two are logged with the
    /// request ID like any handler error.
    pub fn apply_to_router<S>(self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router
            .layer(from_fn_with_state(self.rate_limit, rate_limit_middleware))
            .layer(from_fn_with_state(self.auth_config, auth_middleware))
            .layer(from_fn(error_handling_middleware))
            .layer(from_fn(logging_middleware))
            .layer(from_fn(request_id_middleware))
    }

    pub fn with_auth(mut self, auth_config: AuthConfig) -> Self {
        self.auth_config = Arc::new(auth_config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::headers::paths;
    use crate::proxy::types::REQUEST_ID_HEADER;
    use axum::{body::Body, http::StatusCode, response::IntoResponse};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn handler() -> impl IntoResponse {
        StatusCode::OK
    }

    fn limiter(burst: u32) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(Duration::from_secs(60), 60, burst))
    }

    fn app(stack: ProxyMiddlewareStack) -> Router {
        let router = Router::new()
            .route(paths::SEARCH, axum::routing::post(handler))
            .route(paths::HEALTH, axum::routing::get(handler));
        stack.apply_to_router(router)
    }

    fn post_search() -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(paths::SEARCH)
            .header("Authorization", "Bearer test-key")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_middleware_stack_builder() {
        let stack = ProxyMiddlewareStack::new(AuthConfig::from_keys(["test-key"]), limiter(10));

        let response = app(stack).oneshot(post_search()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn test_rejections_carry_request_id() {
        let stack = ProxyMiddlewareStack::new(AuthConfig::default(), limiter(10))
            .with_auth(AuthConfig::from_keys(["other-key"]));

        let response = app(stack).oneshot(post_search()).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_bypasses_auth_and_rate_limit() {
        let stack = ProxyMiddlewareStack::new(AuthConfig::from_keys(["test-key"]), limiter(1));
        let app = app(stack);

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(
                    axum::http::Request::builder()
                        .uri(paths::HEALTH)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }
}
