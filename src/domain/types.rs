//! Validated request values
//!
//! Inputs are checked at the boundary so that nothing downstream of a
//! handler ever sees an empty, oversized or out-of-range value.

use nutype::nutype;
#[allow(unused_imports)] // These are used by nutype derive macros
use serde::{Deserialize, Serialize};

/// Free-text search query, trimmed, 1..=200 characters
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 200),
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
pub struct SearchQuery(String);

impl SearchQuery {
    /// Cache-key form of the query: lower-cased with runs of whitespace collapsed
    pub fn normalized(&self) -> String {
        self.as_ref()
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Number of results requested from a search, 1..=5
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 5),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Serialize,
        Deserialize,
        AsRef,
        Display
    )
)]
pub struct MaxResults(u8);

impl Default for MaxResults {
    fn default() -> Self {
        Self::try_new(super::validation_constants::max_results::DEFAULT)
            .expect("default result count is within bounds")
    }
}
