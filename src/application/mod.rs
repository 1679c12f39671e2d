//! Process-level wiring
//!
//! Turns loaded settings into a running HTTP server with its background
//! maintenance task.

pub mod app;

pub use app::Application;
