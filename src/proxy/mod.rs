//! HTTP surface and resumable media relay
//!
//! Request flow for `/proxy-stream`:
//! - rate limiter (middleware) per caller
//! - destination screening, circuit breaker, per-URL admission gate
//! - streaming with transparent resume on upstream interruption

pub mod destination;
pub mod engine;
pub mod error_response;
pub mod handlers;
pub mod headers;
pub mod middleware;
pub mod middleware_stack;
pub mod range;
pub mod service;
pub mod transfer;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;



pub use destination::{DestinationPolicy, DestinationRejection, DestinationValidator};
pub use engine::{EngineConfig, ProxyEngine};
pub use middleware::AuthConfig;
pub use service::{RelayService, RelayState};
pub use types::{ProxyError, ProxyResult};
