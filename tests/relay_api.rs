//! End-to-end tests of the relay's HTTP API through the public crate surface
//!
//! The media helper is replaced by an in-process fake so no external
//! binary is needed.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stream_relay::config::Settings;
use stream_relay::proxy::RelayService;
use stream_relay::resolver::{HelperError, HelperInvocation, HelperOutput, MediaHelper};
use tower::ServiceExt;

/// Answers searches and extractions from canned output
#[derive(Default)]
struct FakeHelper {
    searches: AtomicUsize,
    extractions: AtomicUsize,
}

const SEARCH_LINES: &str = concat!(
    r#"{"id":"dQw4w9WgXcQ","title":"Never Gonna Give You Up","url":"https://www.youtube.com/watch?v=dQw4w9WgXcQ","uploader":"Rick Astley","duration":212.4}"#,
    "\n",
    r#"{"id":"yPYZpwSpKmA","title":"Together Forever","url":"https://www.youtube.com/watch?v=yPYZpwSpKmA","channel":"Rick Astley"}"#,
    "\n",
);

const EXTRACTION: &str = r#"{"id":"dQw4w9WgXcQ","url":"https://i.ytimg.com/vi/dQw4w9WgXcQ/hqdefault.jpg","formats":[
    {"format_id":"18","url":"https://rr3---sn-a.googlevideo.com/videoplayback?itag=18","acodec":"mp4a.40.2","vcodec":"avc1.42001E","ext":"mp4","protocol":"https","abr":96},
    {"format_id":"140","url":"https://rr3---sn-a.googlevideo.com/videoplayback?itag=140","acodec":"mp4a.40.2","vcodec":"none","ext":"m4a","protocol":"https","abr":129.5},
    {"format_id":"251","url":"https://rr3---sn-a.googlevideo.com/videoplayback?itag=251","acodec":"opus","vcodec":"none","ext":"webm","protocol":"https","abr":130}
]}"#;

#[async_trait]
impl MediaHelper for FakeHelper {
    async fn run(&self, invocation: &HelperInvocation) -> Result<HelperOutput, HelperError> {
        let stdout = if invocation.args.iter().any(|arg| arg == "-J") {
            self.extractions.fetch_add(1, Ordering::SeqCst);
            EXTRACTION
        } else {
            self.searches.fetch_add(1, Ordering::SeqCst);
            SEARCH_LINES
        };
        Ok(HelperOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }
}

fn service() -> (Arc<FakeHelper>, RelayService) {
    let mut settings = Settings::new().unwrap();
    settings.helper.cookies_path = None;
    settings.auth.api_keys = Vec::new();
    settings.rate_limit.burst = 100;
    let helper = Arc::new(FakeHelper::default());
    let service = RelayService::with_helper(&settings, helper.clone()).unwrap();
    (helper, service)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_search_then_stream() {
    let (helper, service) = service();
    let router = service.into_router();

    let response = router
        .clone()
        .oneshot(post("/search", json!({"query": "rick astley", "maxResults": 1})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["title"], "Never Gonna Give You Up");
    assert_eq!(results[0]["creator"], "Rick Astley");
    assert_eq!(results[0]["durationSeconds"], 212);

    let response = router
        .oneshot(post("/stream", json!({"url": results[0]["url"]})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(
        body["streamUrl"],
        "https://rr3---sn-a.googlevideo.com/videoplayback?itag=251"
    );

    assert_eq!(helper.searches.load(Ordering::SeqCst), 1);
    assert_eq!(helper.extractions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_query_normalization_shares_cache() {
    let (helper, service) = service();
    let router = service.into_router();

    for query in ["Rick Astley", "  rick   ASTLEY "] {
        let response = router
            .clone()
            .oneshot(post("/search", json!({"query": query})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(helper.searches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_non_video_urls_never_reach_helper() {
    let (helper, service) = service();
    let router = service.into_router();

    for url in [
        "https://www.youtube.com/@RickAstleyYT",
        "https://www.youtube.com/channel/UCuAXFkgsw1L7xaCfnd5JJOw",
        "https://www.youtube.com/shorts/dQw4w9WgXcQ",
        "https://example.com/watch?v=dQw4w9WgXcQ",
    ] {
        let response = router
            .clone()
            .oneshot(post("/stream", json!({"url": url})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{url}");
    }
    assert_eq!(helper.extractions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_internal_destinations_are_refused_by_default() {
    let (_, service) = service();
    let router = service.into_router();

    for target in [
        "http://rr3---sn-a.googlevideo.com/videoplayback",
        "https://127.0.0.1/videoplayback",
        "https://169.254.169.254/latest/meta-data",
        "https://[::1]/videoplayback",
        "https://evil.example.com/videoplayback",
    ] {
        let uri = format!("/proxy-stream?url={}", urlencoding::encode(target));
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{target}");
        assert_eq!(json_body(response).await["code"], "DESTINATION_REJECTED");
    }
}
