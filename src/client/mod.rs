//! Resilient outbound HTTP client.
//!
//! This module layers admission control and failure isolation on top of a
//! pooled network session:
//!
//! - [`RateLimiter`] - per-domain token-bucket pacing with FIFO admission
//! - [`CircuitBreaker`] - per-domain failure state machine with a
//!   single-flight half-open probe
//! - [`SessionPool`] - lazily built, double-checked pooled session with an
//!   idempotent `close`
//! - [`RequestExecutor`] - the facade composing the three, with semaphore
//!   backpressure, an exponential-backoff retry loop, and request statistics
//!
//! Domains are keyed by `scheme://host`, so rate limits, circuits, and
//! per-endpoint counters for unrelated services never interfere.
//!
//! # Example
//!
//! ```no_run
//! use httpguard::client::{ClientConfig, RequestExecutor, RequestOptions};
//!
//! # async fn example() -> Result<(), httpguard::client::HttpError> {
//! let executor = RequestExecutor::new(ClientConfig::default())?;
//!
//! let response = executor
//!     .get("https://api.example.com/v1/items", &RequestOptions::default())
//!     .await?;
//! println!("{} -> {}", response.url(), response.status());
//!
//! let stats = executor.stats();
//! println!("requests: {}, retries: {}", stats.totals.requests, stats.totals.retries);
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod constants;
pub mod domain;
mod error;
mod executor;
mod pool;
pub mod rate_limiter;
mod stats;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use config::{ClientConfig, RateLimitOverride};
pub use domain::{domain_key, parse_domain_key};
pub use error::HttpError;
pub use executor::{RequestExecutor, RequestOptions};
pub use pool::SessionPool;
pub use rate_limiter::{RateLimiter, parse_retry_after};
pub use stats::{CounterSnapshot, LatencySummary, RequestStats, StatsSnapshot};
