//! Stream Relay - search, resolve and relay audio streams
//!
//! Turns free-text queries into playable video results, resolves a video to
//! a direct audio stream URL through an external media helper, and relays
//! that stream through a resumable proxy guarded by destination screening,
//! per-caller rate limiting, per-URL admission and a circuit breaker.

pub mod admission;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod proxy;
pub mod resolver;

pub use application::Application;
pub use error::{Error, Result};
