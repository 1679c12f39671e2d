//! Byte-range helpers for client `Range` and upstream `Content-Range` headers
//!
//! Only the single `bytes=START-` / `bytes=START-END` form is honoured.
//! Suffix and multi-part ranges are treated as "no range" and the whole
//! resource is relayed, which every HTTP client has to accept anyway.

use std::fmt;

/// A requested byte window, `end` inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn from_start(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Parse a `Range` request header value
    pub fn parse(value: &str) -> Option<Self> {
        let (unit, range_set) = value.trim().split_once('=')?;
        if !unit.trim().eq_ignore_ascii_case("bytes") {
            return None;
        }
        let range_set = range_set.trim();
        if range_set.contains(',') {
            return None;
        }
        let (start, end) = range_set.split_once('-')?;
        let start: u64 = start.trim().parse().ok()?;
        let end = match end.trim() {
            "" => None,
            end => {
                let end: u64 = end.parse().ok()?;
                if end < start {
                    return None;
                }
                Some(end)
            }
        };
        Some(Self { start, end })
    }

    /// The range still outstanding after `delivered` bytes of this one
    pub fn advanced_by(&self, delivered: u64) -> Self {
        Self {
            start: self.start.saturating_add(delivered),
            end: self.end,
        }
    }

    /// Byte count, when the end is known
    pub fn byte_count(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }

    /// Whether this asks for the whole resource
    pub fn is_full(&self) -> bool {
        self.start == 0 && self.end.is_none()
    }

    pub fn header_value(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "bytes={}-{}", self.start, end),
            None => write!(f, "bytes={}-", self.start),
        }
    }
}

/// A parsed `Content-Range: bytes START-END/TOTAL` response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (span, total) = rest.split_once('/')?;
        let (start, end) = span.trim().split_once('-')?;
        let start: u64 = start.trim().parse().ok()?;
        let end: u64 = end.trim().parse().ok()?;
        if end < start {
            return None;
        }
        let total = match total.trim() {
            "*" => None,
            total => Some(total.parse().ok()?),
        };
        Some(Self { start, end, total })
    }

    pub fn byte_count(&self) -> u64 {
        self.end - self.start + 1
    }
}
