//! Search resolution with tiered helper strategies
//!
//! A cache hit answers immediately. On a miss the fast strategy runs first
//! (one preferred player client, short timeout); only when it yields nothing
//! does the broad strategy run (unrestricted client, longer timeout). Helper
//! failures and timeouts count as "no results", never as errors.

use crate::config::{CacheSettings, HelperSettings};
use crate::domain::{MaxResults, SearchQuery, SearchResult, SourceKind, VideoUrl};
use crate::resolver::cache::{CacheStats, TtlCache};
use crate::resolver::credentials::CredentialedHelper;
use crate::resolver::helper::HelperError;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Extra entries requested so that filtered-out non-video entries do not
/// leave the caller short
const OVERFETCH: u8 = 2;

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub fast_timeout: Duration,
    pub broad_timeout: Duration,
    pub fast_player_client: String,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
}

impl SearchConfig {
    pub fn from_settings(helper: &HelperSettings, cache: &CacheSettings) -> Self {
        Self {
            fast_timeout: Duration::from_secs(helper.fast_timeout_secs),
            broad_timeout: Duration::from_secs(helper.broad_timeout_secs),
            fast_player_client: helper.fast_player_client.clone(),
            cache_ttl: Duration::from_secs(cache.ttl_secs),
            cache_capacity: cache.capacity,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            fast_timeout: Duration::from_secs(8),
            broad_timeout: Duration::from_secs(20),
            fast_player_client: "android".to_string(),
            cache_ttl: Duration::from_secs(600),
            cache_capacity: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchStrategy {
    Fast,
    Broad,
}

impl SearchStrategy {
    fn name(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Broad => "broad",
        }
    }
}

/// One line of `--dump-json --flat-playlist` output
#[derive(Debug, Deserialize)]
struct FlatEntry {
    #[serde(rename = "_type")]
    kind: Option<String>,
    id: Option<String>,
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

impl FlatEntry {
    /// Accept only entries that resolve to exactly one video
    fn into_search_result(self) -> Option<SearchResult> {
        if matches!(self.kind.as_deref(), Some("playlist")) {
            return None;
        }

        let canonical_url = match self.webpage_url.as_deref().or(self.url.as_deref()) {
            Some(url) => VideoUrl::parse(url).ok()?,
            None => VideoUrl::from_video_id(self.id.as_deref()?)?,
        };

        let title = self.title.filter(|t| !t.trim().is_empty())?;
        let duration_seconds = self
            .duration
            .filter(|d| d.is_finite() && *d >= 0.0)
            .map(|d| d.round() as u64);
        let thumbnail_url = self
            .thumbnail
            .or_else(|| self.thumbnails.into_iter().last().map(|t| t.url));

        Some(SearchResult {
            title,
            creator: self.uploader.or(self.channel),
            duration_seconds,
            canonical_url,
            thumbnail_url,
            source_kind: SourceKind::Video,
        })
    }
}

/// Parse helper stdout, dropping unparsable lines and non-video entries
fn parse_results(stdout: &str, max_results: usize) -> Vec<SearchResult> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<FlatEntry>(line) {
            Ok(entry) => entry.into_search_result(),
            Err(e) => {
                debug!(error = %e, "Skipping unparsable helper output line");
                None
            }
        })
        .take(max_results)
        .collect()
}

pub struct SearchResolver {
    helper: CredentialedHelper,
    cache: TtlCache<(String, u8), Vec<SearchResult>>,
    config: SearchConfig,
}

impl SearchResolver {
    pub fn new(helper: CredentialedHelper, config: SearchConfig) -> Self {
        Self {
            helper,
            cache: TtlCache::new(config.cache_capacity, config.cache_ttl),
            config,
        }
    }

    /// Resolve a query to at most `max_results` playable videos
    #[instrument(skip(self), fields(query = %query, max_results = %max_results))]
    pub async fn search(&self, query: &SearchQuery, max_results: MaxResults) -> Vec<SearchResult> {
        let key = (query.normalized(), max_results.into_inner());
        if let Some(results) = self.cache.get(&key) {
            debug!(count = results.len(), "Search cache hit");
            return results;
        }

        let mut results = self
            .run_strategy(SearchStrategy::Fast, query, max_results)
            .await;
        if results.is_empty() {
            info!("Fast search strategy found nothing; falling back to broad strategy");
            results = self
                .run_strategy(SearchStrategy::Broad, query, max_results)
                .await;
        }

        info!(count = results.len(), "Search resolved");
        self.cache.insert(key, results.clone());
        results
    }

    fn strategy_args(
        &self,
        strategy: SearchStrategy,
        query: &SearchQuery,
        max_results: MaxResults,
    ) -> Vec<String> {
        let mut args = vec![
            "--flat-playlist".to_string(),
            "--dump-json".to_string(),
            "--skip-download".to_string(),
        ];
        if strategy == SearchStrategy::Fast {
            args.push("--extractor-args".to_string());
            args.push(format!(
                "youtube:player_client={}",
                self.config.fast_player_client
            ));
        }
        args.push(format!(
            "ytsearch{}:{}",
            max_results.into_inner() + OVERFETCH,
            query.as_ref()
        ));
        args
    }

    async fn run_strategy(
        &self,
        strategy: SearchStrategy,
        query: &SearchQuery,
        max_results: MaxResults,
    ) -> Vec<SearchResult> {
        let timeout = match strategy {
            SearchStrategy::Fast => self.config.fast_timeout,
            SearchStrategy::Broad => self.config.broad_timeout,
        };
        let args = self.strategy_args(strategy, query, max_results);

        match self.helper.run(args, timeout, |_| false).await {
            Ok(output) => {
                if !output.success() {
                    warn!(
                        strategy = strategy.name(),
                        exit_code = ?output.exit_code,
                        stderr = %output.stderr.trim(),
                        "Search helper exited unsuccessfully"
                    );
                }
                parse_results(&output.stdout, usize::from(max_results.into_inner()))
            }
            Err(HelperError::Timeout(after)) => {
                warn!(
                    strategy = strategy.name(),
                    timeout_ms = after.as_millis() as u64,
                    "Search helper timed out"
                );
                Vec::new()
            }
            Err(e) => {
                warn!(strategy = strategy.name(), error = %e, "Search helper failed");
                Vec::new()
            }
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }
}
