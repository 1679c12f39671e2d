//! Test utilities for relay testing
//!
//! Local upstreams bind to 127.0.0.1, so the helpers here configure a
//! destination policy that admits plain HTTP to loopback only.

use crate::config::Settings;
use crate::proxy::destination::{DestinationPolicy, DestinationValidator};
use crate::resolver::credentials::test_support::ScriptedHelper;
use crate::proxy::RelayService;
use axum::{body::Body, response::Response, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Policy admitting `http://127.0.0.1:*` and nothing else
pub fn loopback_policy() -> DestinationPolicy {
    DestinationPolicy {
        allowed_schemes: vec!["http".to_string()],
        allowed_host_suffixes: vec!["127.0.0.1".to_string()],
        allowed_ranges: vec!["127.0.0.0/8".parse().expect("valid range")],
    }
}

pub fn loopback_validator() -> DestinationValidator {
    DestinationValidator::new(loopback_policy())
}

/// Default settings with quick retries and loopback destinations
pub fn test_settings() -> Settings {
    let mut settings = Settings::new().expect("default settings load");
    settings.destination.allowed_schemes = vec!["http".to_string()];
    settings.destination.allowed_host_suffixes = vec!["127.0.0.1".to_string()];
    settings.destination.allowed_cidrs = vec!["127.0.0.0/8".to_string()];
    settings.proxy.retry_backoff_ms = 5;
    settings.helper.cookies_path = None;
    settings.auth.api_keys = Vec::new();
    settings.application.public_base_url = None;
    settings.rate_limit.burst = 1000;
    settings
}

/// Relay service backed by a scripted helper
pub fn scripted_service(settings: &Settings) -> (Arc<ScriptedHelper>, RelayService) {
    let helper = Arc::new(ScriptedHelper::new());
    let service = RelayService::with_helper(settings, helper.clone()).expect("service builds");
    (helper, service)
}

/// Serve `router` on an ephemeral loopback port
pub async fn start_upstream(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("upstream serves");
    });
    addr
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("complete body")
        .to_vec()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).expect("JSON body")
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("valid request")
}

/// Deterministic payload of `len` bytes
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
