//! Route handlers for the relay's HTTP surface

use crate::domain::{MaxResults, SearchQuery, SearchResult, VideoUrl};
use crate::proxy::headers::{header_str, paths, HOST, RANGE};
use crate::proxy::service::RelayState;
use crate::proxy::types::{ProxyError, ProxyResult, SERVICE_NAME};
use crate::resolver::CacheStats;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::{HeaderMap, Method},
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub max_results: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    pub url: String,
    #[serde(default)]
    pub proxy: bool,
    #[serde(default)]
    pub bypass: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResponse {
    pub stream_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ProxyStreamParams {
    pub url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsResponse {
    pub search: CacheStats,
    pub stream_urls: CacheStats,
    pub credentials_suspended: bool,
}

#[derive(Debug, Serialize)]
pub struct CacheClearResponse {
    pub cleared: bool,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: SERVICE_NAME.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[instrument(skip_all)]
pub async fn search(
    State(state): State<Arc<RelayState>>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> ProxyResult<Json<SearchResponse>> {
    let Json(request) = payload.map_err(|e| ProxyError::InvalidInput(e.body_text()))?;

    let query = SearchQuery::try_new(request.query)
        .map_err(|_| ProxyError::InvalidInput("query must be 1 to 200 characters".to_string()))?;
    let max_results = match request.max_results {
        None => MaxResults::default(),
        Some(n) => u8::try_from(n)
            .ok()
            .and_then(|n| MaxResults::try_new(n).ok())
            .ok_or_else(|| {
                ProxyError::InvalidInput("maxResults must be between 1 and 5".to_string())
            })?,
    };

    let results = state.search.search(&query, max_results).await;
    Ok(Json(SearchResponse { results }))
}

#[instrument(skip_all)]
pub async fn stream(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    payload: Result<Json<StreamRequest>, JsonRejection>,
) -> ProxyResult<Json<StreamResponse>> {
    let Json(request) = payload.map_err(|e| ProxyError::InvalidInput(e.body_text()))?;

    let video = VideoUrl::parse(&request.url).map_err(|_| {
        ProxyError::InvalidInput("url must address a single video".to_string())
    })?;

    let resolved = if request.bypass {
        state.extractor.refresh_stream_url(&video).await
    } else {
        state.extractor.resolve_stream_url(&video).await
    };
    let stream_url =
        resolved.ok_or_else(|| ProxyError::StreamNotFound(video.as_ref().to_string()))?;

    let stream_url = if request.proxy {
        let base = state
            .public_base_url
            .clone()
            .or_else(|| header_str(&headers, &HOST).map(|host| format!("http://{host}")))
            .unwrap_or_default();
        proxy_url(&base, &stream_url)
    } else {
        stream_url
    };

    info!(video_id = video.video_id(), proxied = request.proxy, "Stream URL issued");
    Ok(Json(StreamResponse { stream_url }))
}

/// Same-origin URL that relays `stream_url` through `/proxy-stream`
pub fn proxy_url(base: &str, stream_url: &str) -> String {
    format!(
        "{}{}?url={}",
        base.trim_end_matches('/'),
        paths::PROXY_STREAM,
        urlencoding::encode(stream_url)
    )
}

pub async fn proxy_stream(
    State(state): State<Arc<RelayState>>,
    method: Method,
    headers: HeaderMap,
    params: Result<Query<ProxyStreamParams>, QueryRejection>,
) -> ProxyResult<Response> {
    let Query(params) = params.map_err(|e| ProxyError::InvalidInput(e.body_text()))?;
    state
        .engine
        .relay(method, &params.url, header_str(&headers, &RANGE))
        .await
}

pub async fn cache_stats(State(state): State<Arc<RelayState>>) -> Json<CacheStatsResponse> {
    Json(CacheStatsResponse {
        search: state.search.cache_stats(),
        stream_urls: state.extractor.cache_stats(),
        credentials_suspended: state.credentials.is_suspended(),
    })
}

pub async fn cache_clear(State(state): State<Arc<RelayState>>) -> Json<CacheClearResponse> {
    state.search.clear_cache();
    state.extractor.clear_cache();
    info!("Caches cleared");
    Json(CacheClearResponse { cleared: true })
}
