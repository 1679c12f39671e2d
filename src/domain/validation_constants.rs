//! Validation constants for domain types
//!
//! This module centralizes the limits and patterns used by the validated
//! request types so handlers, resolvers and tests agree on them.

/// Search query limits
pub mod search_query {
    /// Maximum query length in characters, after trimming
    pub const MAX_LENGTH: usize = 200;
}

/// Result count limits for a single search
pub mod max_results {
    /// Smallest accepted `maxResults`
    pub const MIN: u8 = 1;

    /// Largest accepted `maxResults`
    pub const MAX: u8 = 5;

    /// Used when a request omits `maxResults`
    pub const DEFAULT: u8 = 3;
}

/// Canonical video URL shape
pub mod video_url {
    /// Prefix of every canonical watch URL
    pub const WATCH_PREFIX: &str = "https://www.youtube.com/watch?v=";

    /// Hosts that serve watch pages
    pub const WATCH_HOSTS: &[&str] = &[
        "youtube.com",
        "www.youtube.com",
        "m.youtube.com",
        "music.youtube.com",
    ];

    /// Short-link host, where the path is the video id
    pub const SHORT_LINK_HOST: &str = "youtu.be";
}
