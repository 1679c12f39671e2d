//! Search result model

use crate::domain::VideoUrl;
use serde::{Deserialize, Serialize};

/// Kind of source a result points at; only single videos survive ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Video,
}

/// One playable video found for a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub title: String,
    pub creator: Option<String>,
    pub duration_seconds: Option<u64>,
    /// Serialized as `url` so callers can hand it straight to `/stream`
    #[serde(rename = "url", alias = "canonicalUrl")]
    pub canonical_url: VideoUrl,
    pub thumbnail_url: Option<String>,
    pub source_kind: SourceKind,
}
