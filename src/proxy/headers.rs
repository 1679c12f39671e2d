//! HTTP header and path constants for the relay surface

use ::http::HeaderMap;

/// Query parameter carrying the upstream URL on `/proxy-stream`
pub const URL_QUERY_PARAM: &str = "url";

/// Standard header re-exports for convenience
pub use ::http::header::{AUTHORIZATION, HOST, RANGE, RETRY_AFTER};

/// Well-known paths
pub mod paths {
    /// Health check endpoint path
    pub const HEALTH: &str = "/health";

    pub const SEARCH: &str = "/search";

    pub const STREAM: &str = "/stream";

    pub const PROXY_STREAM: &str = "/proxy-stream";

    pub const CACHE_STATS: &str = "/cache/stats";

    pub const CACHE_CLEAR: &str = "/cache/clear";
}

/// Header value as text, if present and valid ASCII
pub fn header_str<'a>(headers: &'a HeaderMap, name: &::http::header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
