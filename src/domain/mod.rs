//! Domain types for the stream relay
//!
//! Validated request values and the search result model shared by the
//! resolver and the HTTP surface.

pub mod search_result;
pub mod types;
pub mod validation_constants;
pub mod video_url;

pub use search_result::{SearchResult, SourceKind};
pub use types::{MaxResults, SearchQuery};
pub use video_url::{canonical_video_url, VideoUrl};
