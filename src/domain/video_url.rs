//! Canonical single-video URLs
//!
//! A URL is canonical when it addresses exactly one playable video. Watch
//! pages (`/watch?v=<id>`) on any platform host and `youtu.be/<id>` short
//! links are accepted and rewritten to one form; channels, playlists,
//! shorts and everything else are not.

use crate::domain::validation_constants::video_url::{SHORT_LINK_HOST, WATCH_HOSTS, WATCH_PREFIX};
use nutype::nutype;
#[allow(unused_imports)] // These are used by nutype derive macros
use serde::{Deserialize, Serialize};
use url::Url;

/// Length of a platform video id
const VIDEO_ID_LEN: usize = 11;

/// A watch-page URL in canonical form, `https://www.youtube.com/watch?v=<id>`
#[nutype(
    validate(regex = r"^https://www\.youtube\.com/watch\?v=[A-Za-z0-9_-]{11}$"),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        AsRef,
        Display
    )
)]
pub struct VideoUrl(String);

impl VideoUrl {
    /// Accept any recognised single-video URL shape and canonicalize it
    pub fn parse(raw: &str) -> Result<Self, VideoUrlError> {
        let candidate = canonical_video_url(raw).unwrap_or_else(|| raw.trim().to_string());
        Self::try_new(candidate)
    }

    /// Build the canonical URL for a bare video id
    pub fn from_video_id(id: &str) -> Option<Self> {
        is_video_id(id)
            .then(|| Self::try_new(format!("{WATCH_PREFIX}{id}")).ok())
            .flatten()
    }

    pub fn video_id(&self) -> &str {
        &self.as_ref()[WATCH_PREFIX.len()..]
    }
}

/// Rewrite a single-video URL to canonical form, or `None` if it does not
/// address exactly one video
pub fn canonical_video_url(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }

    let host = parsed.host_str()?.to_ascii_lowercase();
    let id = if WATCH_HOSTS.contains(&host.as_str()) {
        if parsed.path() != "/watch" {
            return None;
        }
        parsed
            .query_pairs()
            .find(|(key, _)| key == "v")
            .map(|(_, value)| value.into_owned())?
    } else if host == SHORT_LINK_HOST {
        let mut segments = parsed.path_segments()?;
        let id = segments.next()?.to_string();
        if segments.next().is_some() {
            return None;
        }
        id
    } else {
        return None;
    };

    is_video_id(&id).then(|| format!("{WATCH_PREFIX}{id}"))
}

fn is_video_id(id: &str) -> bool {
    id.len() == VIDEO_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
