//! httpguard - resilient outbound HTTP client.
//!
//! A shared, pooled network-session manager wrapped with per-domain
//! token-bucket rate limiting, per-domain circuit breaking,
//! concurrency-bounding backpressure, and retrying request execution with
//! latency/error statistics.
//!
//! # Architecture
//!
//! Everything lives under the [`client`] module:
//! - [`client::RateLimiter`] - token-bucket admission, no network dependency
//! - [`client::CircuitBreaker`] - failure state machine, no network dependency
//! - [`client::SessionPool`] - lazy pooled `reqwest` session
//! - [`client::RequestExecutor`] - the facade: `get` / `post` / `download`
//!   plus statistics accessors
//!
//! Logging goes through the `tracing` facade; install any subscriber to
//! consume the structured events this crate emits.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;

// Re-export commonly used types
pub use client::{
    CircuitBreaker, CircuitState, ClientConfig, CounterSnapshot, HttpError, LatencySummary,
    RateLimitOverride, RateLimiter, RequestExecutor, RequestOptions, SessionPool, StatsSnapshot,
};
