//! Admission control for proxied transfers
//!
//! Three independent guards, applied in a fixed order at the proxy entry:
//! the per-caller [`RateLimiter`] (middleware), the shared
//! [`CircuitBreaker`], then the per-destination [`AdmissionGate`].

pub mod circuit_breaker;
pub mod gate;
pub mod rate_limiter;

pub use circuit_breaker::CircuitBreaker;
pub use gate::{AdmissionGate, AdmissionPermit, QueueTimeout};
pub use rate_limiter::RateLimiter;
