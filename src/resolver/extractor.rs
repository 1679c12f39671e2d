//! Direct stream URL extraction
//!
//! The helper dumps the full format list for one video; the best audio
//! format is picked locally so the choice does not depend on the helper's
//! own format-selection quirks.

use crate::config::{CacheSettings, HelperSettings};
use crate::domain::VideoUrl;
use crate::resolver::cache::{CacheStats, TtlCache};
use crate::resolver::credentials::CredentialedHelper;
use crate::resolver::helper::HelperOutput;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Substrings marking URLs that are images rather than media
const NON_MEDIA_MARKERS: &[&str] = &["googleusercontent.com/thumbnail", "storyboard"];

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
}

impl ExtractorConfig {
    pub fn from_settings(helper: &HelperSettings, cache: &CacheSettings) -> Self {
        Self {
            timeout: Duration::from_secs(helper.extract_timeout_secs),
            cache_ttl: Duration::from_secs(cache.stream_url_ttl_secs),
            cache_capacity: cache.stream_url_capacity,
        }
    }
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(25),
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 500,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct MediaInfo {
    url: Option<String>,
    is_live: Option<bool>,
    #[serde(default)]
    formats: Vec<MediaFormat>,
    #[serde(default)]
    entries: Vec<MediaInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct MediaFormat {
    format_id: Option<String>,
    url: Option<String>,
    acodec: Option<String>,
    vcodec: Option<String>,
    ext: Option<String>,
    protocol: Option<String>,
    abr: Option<f64>,
}

impl MediaFormat {
    /// Preference score, or `None` when the format carries no audio or URL
    fn score(&self) -> Option<i64> {
        let acodec = self.acodec.as_deref().unwrap_or_default().to_lowercase();
        if acodec.is_empty() || acodec == "none" || self.url.is_none() {
            return None;
        }

        let mut score = 0;
        if matches!(self.vcodec.as_deref(), None | Some("none")) {
            score += 10;
        }
        if acodec.starts_with("opus") || acodec.starts_with("vorbis") {
            score += 6;
        }
        if acodec.starts_with("mp4a") || acodec.starts_with("aac") {
            score += 5;
        }
        let ext = self.ext.as_deref().unwrap_or_default().to_lowercase();
        if matches!(ext.as_str(), "webm" | "m4a" | "mp4") {
            score += 5;
        }
        let protocol = self.protocol.as_deref().unwrap_or_default();
        if protocol.starts_with("https") {
            score += 3;
        } else if protocol.starts_with("http") {
            score += 1;
        }
        if let Some(abr) = self.abr.filter(|abr| abr.is_finite()) {
            score += abr.trunc() as i64;
        }
        Some(score)
    }
}

fn parse_media_info(stdout: &str) -> Option<MediaInfo> {
    serde_json::from_str(stdout.trim()).ok()
}

/// Pick the playable URL out of a helper dump
fn select_stream_url(mut info: MediaInfo) -> Option<String> {
    if !info.entries.is_empty() {
        info = info.entries.swap_remove(0);
    }

    if info.is_live == Some(true) {
        debug!("Rejecting live stream");
        return None;
    }

    // Ties keep the helper's original ordering
    let best = info
        .formats
        .iter()
        .filter_map(|format| format.score().map(|score| (score, format)))
        .reduce(|best, candidate| if candidate.0 > best.0 { candidate } else { best });

    let url = match best {
        Some((score, format)) => {
            debug!(
                format_id = format.format_id.as_deref().unwrap_or("?"),
                score, "Selected stream format"
            );
            format.url.clone()
        }
        None => info
            .url
            .filter(|url| !url.contains("youtube.com/watch")),
    }?;

    if NON_MEDIA_MARKERS.iter().any(|marker| url.contains(marker)) {
        return None;
    }
    Some(url)
}

fn needs_retry(output: &HelperOutput) -> bool {
    !output.success() || parse_media_info(&output.stdout).is_none()
}

pub struct StreamExtractor {
    helper: CredentialedHelper,
    cache: TtlCache<String, String>,
    config: ExtractorConfig,
}

impl StreamExtractor {
    pub fn new(helper: CredentialedHelper, config: ExtractorConfig) -> Self {
        Self {
            helper,
            cache: TtlCache::new(config.cache_capacity, config.cache_ttl),
            config,
        }
    }

    /// Resolve a canonical video to a short-lived direct media URL
    ///
    /// `None` means nothing usable was found right now; callers should treat
    /// it as retryable later rather than fatal.
    pub async fn resolve_stream_url(&self, video: &VideoUrl) -> Option<String> {
        if let Some(url) = self.cache.get(&video.as_ref().to_string()) {
            debug!(video_id = video.video_id(), "Stream URL cache hit");
            return Some(url);
        }
        self.extract(video).await
    }

    /// Resolve without consulting the cache, replacing any cached URL
    pub async fn refresh_stream_url(&self, video: &VideoUrl) -> Option<String> {
        self.cache.remove(&video.as_ref().to_string());
        self.extract(video).await
    }

    #[instrument(skip(self), fields(video_id = video.video_id()))]
    async fn extract(&self, video: &VideoUrl) -> Option<String> {
        let args = vec![
            "-f".to_string(),
            "bestaudio/best".to_string(),
            "-J".to_string(),
            "--no-playlist".to_string(),
            video.as_ref().to_string(),
        ];

        let output = match self.helper.run(args, self.config.timeout, needs_retry).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Stream extraction helper failed");
                return None;
            }
        };

        if !output.success() {
            warn!(
                exit_code = ?output.exit_code,
                stderr = %output.stderr.trim(),
                "Stream extraction helper exited unsuccessfully"
            );
            return None;
        }

        let Some(info) = parse_media_info(&output.stdout) else {
            warn!("Stream extraction produced unparsable output");
            return None;
        };

        let url = select_stream_url(info)?;
        info!("Stream URL resolved");
        self.cache.insert(video.as_ref().to_string(), url.clone());
        Some(url)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::credentials::test_support::ScriptedHelper;
    use crate::resolver::credentials::CredentialState;
    use serde_json::json;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    const VIDEO: &str = "https://www.youtube.com/watch?v=JGwWNGJdvx8";

    fn dump(value: serde_json::Value) -> String {
        value.to_string()
    }

    fn typical_dump() -> String {
        dump(json!({
            "id": "JGwWNGJdvx8",
            "url": "https://rr1---sn-abc.googlevideo.com/videoplayback?itag=18",
            "is_live": false,
            "formats": [
                {"format_id": "sb0", "url": "https://i.ytimg.com/sb/storyboard", "acodec": "none", "vcodec": "none", "ext": "mhtml"},
                {"format_id": "18", "url": "https://rr1---sn-abc.googlevideo.com/videoplayback?itag=18", "acodec": "mp4a.40.2", "vcodec": "avc1.42001E", "ext": "mp4", "protocol": "https", "abr": 96.0},
                {"format_id": "140", "url": "https://rr1---sn-abc.googlevideo.com/videoplayback?itag=140", "acodec": "mp4a.40.2", "vcodec": "none", "ext": "m4a", "protocol": "https", "abr": 129.5},
                {"format_id": "251", "url": "https://rr1---sn-abc.googlevideo.com/videoplayback?itag=251", "acodec": "opus", "vcodec": "none", "ext": "webm", "protocol": "https", "abr": 135.2}
            ]
        }))
    }

    fn extractor_with(credentials: CredentialState) -> (Arc<ScriptedHelper>, StreamExtractor) {
        let scripted = Arc::new(ScriptedHelper::new());
        let helper = CredentialedHelper::new(scripted.clone(), Arc::new(credentials));
        (scripted, StreamExtractor::new(helper, ExtractorConfig::default()))
    }

    fn video() -> VideoUrl {
        VideoUrl::parse(VIDEO).unwrap()
    }

    #[test]
    fn test_format_scoring_prefers_audio_only_opus() {
        let info = parse_media_info(&typical_dump()).unwrap();
        let url = select_stream_url(info).unwrap();
        assert!(url.ends_with("itag=251"));
    }

    #[test]
    fn test_formats_without_audio_or_url_are_ineligible() {
        let silent = MediaFormat {
            acodec: Some("none".to_string()),
            url: Some("https://example.com".to_string()),
            ..Default::default()
        };
        let missing_url = MediaFormat {
            acodec: Some("opus".to_string()),
            ..Default::default()
        };
        assert_eq!(silent.score(), None);
        assert_eq!(missing_url.score(), None);
    }

    #[test]
    fn test_score_components() {
        let format = MediaFormat {
            acodec: Some("opus".to_string()),
            url: Some("https://example.com".to_string()),
            ext: Some("webm".to_string()),
            protocol: Some("https".to_string()),
            abr: Some(160.9),
            ..Default::default()
        };
        // audio-only 10 + opus 6 + webm 5 + https 3 + abr 160
        assert_eq!(format.score(), Some(184));
    }

    #[test]
    fn test_equal_scores_keep_first_format() {
        let info = parse_media_info(&dump(json!({
            "formats": [
                {"url": "https://a.googlevideo.com/first", "acodec": "opus"},
                {"url": "https://a.googlevideo.com/second", "acodec": "opus"}
            ]
        })))
        .unwrap();
        assert_eq!(
            select_stream_url(info).as_deref(),
            Some("https://a.googlevideo.com/first")
        );
    }

    #[test]
    fn test_live_streams_yield_nothing() {
        let info = parse_media_info(&dump(json!({
            "is_live": true,
            "formats": [{"url": "https://a.googlevideo.com/live", "acodec": "opus"}]
        })))
        .unwrap();
        assert_eq!(select_stream_url(info), None);
    }

    #[test]
    fn test_top_level_url_is_fallback() {
        let info = parse_media_info(&dump(json!({
            "url": "https://a.googlevideo.com/videoplayback?itag=251",
            "formats": []
        })))
        .unwrap();
        assert_eq!(
            select_stream_url(info).as_deref(),
            Some("https://a.googlevideo.com/videoplayback?itag=251")
        );

        let watch_page = parse_media_info(&dump(json!({ "url": VIDEO }))).unwrap();
        assert_eq!(select_stream_url(watch_page), None);
    }

    #[tokio::test]
    async fn test_resolved_url_is_cached() {
        let (scripted, extractor) = extractor_with(CredentialState::disabled());
        scripted.push_ok(0, &typical_dump(), "");

        let first = extractor.resolve_stream_url(&video()).await;
        let second = extractor.resolve_stream_url(&video()).await;

        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(scripted.call_count(), 1);
        let calls = scripted.calls.lock();
        assert_eq!(
            calls[0].args,
            vec!["-f", "bestaudio/best", "-J", "--no-playlist", VIDEO]
        );
    }

    #[tokio::test]
    async fn test_refresh_bypasses_cache() {
        let (scripted, extractor) = extractor_with(CredentialState::disabled());
        scripted.push_ok(0, &typical_dump(), "");
        scripted.push_ok(0, &typical_dump(), "");

        extractor.resolve_stream_url(&video()).await;
        extractor.refresh_stream_url(&video()).await;
        assert_eq!(scripted.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_extraction_is_none_and_not_cached() {
        let (scripted, extractor) = extractor_with(CredentialState::disabled());
        scripted.push_ok(1, "", "ERROR: Video unavailable");
        scripted.push_ok(0, &typical_dump(), "");

        assert_eq!(extractor.resolve_stream_url(&video()).await, None);
        assert!(extractor.resolve_stream_url(&video()).await.is_some());
        assert_eq!(scripted.call_count(), 2);
    }

    #[tokio::test]
    async fn test_unparsable_output_with_cookies_retries_without_them() {
        let mut cookies = NamedTempFile::new().unwrap();
        writeln!(cookies, "# Netscape HTTP Cookie File").unwrap();
        let credentials =
            CredentialState::new(Some(cookies.path().to_path_buf()), Duration::from_secs(60));
        let (scripted, extractor) = extractor_with(credentials);
        scripted.push_ok(0, "Sign in to confirm you're not a bot", "");
        scripted.push_ok(0, &typical_dump(), "");

        assert!(extractor.resolve_stream_url(&video()).await.is_some());

        let calls = scripted.calls.lock();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].cookies.is_some());
        assert!(calls[1].cookies.is_none());
    }

    #[tokio::test]
    async fn test_helper_timeout_yields_none() {
        let (scripted, extractor) = extractor_with(CredentialState::disabled());
        scripted.push_timeout();
        assert_eq!(extractor.resolve_stream_url(&video()).await, None);
    }
}
