//! Type definitions for the relay's HTTP surface

use nutype::nutype;
#[allow(unused_imports)] // These are used by nutype derive macros
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ========== Auth Types ==========

/// API key for authentication
#[nutype(
    derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |s: &str| !s.is_empty()),
)]
pub struct ApiKey(String);

/// Path that bypasses authentication and rate limiting
#[nutype(
    derive(Clone, Debug, Display, Hash, PartialEq, Eq, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |s: &str| s.starts_with('/')),
)]
pub struct BypassPath(String);

// ========== Constants ==========

/// Authorization header prefix for bearer tokens
pub const BEARER_PREFIX: &str = "Bearer ";

/// Header name for request ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Service name reported by the health endpoint
pub const SERVICE_NAME: &str = "stream-relay";

/// Errors surfaced by the relay's request handlers
///
/// Every variant maps to exactly one HTTP status; see
/// [`crate::proxy::error_response::ErrorResponseExt`].
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Destination rejected: {0}")]
    DestinationRejected(String),

    #[error("No playable stream found for {0}")]
    StreamNotFound(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Timed out after {0:?} waiting for an upstream slot")]
    QueueTimeout(Duration),

    #[error("Upstream temporarily unavailable, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Upstream returned status {0}")]
    UpstreamStatus(u16),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Retry hint for capacity errors
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } | Self::CircuitOpen { retry_after } => {
                Some(*retry_after)
            }
            Self::QueueTimeout(_) => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

/// Result type for relay operations
pub type ProxyResult<T> = Result<T, ProxyError>;
