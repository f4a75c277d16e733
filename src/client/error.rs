//! Error types for the client module.
//!
//! Structured errors for every failure path of the request executor. The
//! taxonomy distinguishes fail-fast outcomes (circuit open), per-attempt
//! transient failures (timeout, transport) that are retried within budget,
//! and terminal outcomes (exhausted retries, invalid input). Responses with
//! non-retryable statuses are *not* errors; they are returned to the caller
//! as ordinary responses.

use thiserror::Error;

/// Errors that can occur while executing an HTTP request.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The circuit for the target domain is open; no network call was made.
    #[error("circuit open for {domain}: failing fast without a network call")]
    CircuitOpen {
        /// The domain whose circuit rejected the request.
        domain: String,
    },

    /// The rate limiter failed internally for a domain.
    ///
    /// Admission delay is never an error; this variant only covers limiter
    /// bookkeeping failures and is not retried.
    #[error("rate limiter failure for {domain}")]
    RateLimited {
        /// The domain whose limiter failed.
        domain: String,
    },

    /// A single attempt's network I/O exceeded its timeout.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Transient transport failure (connection reset, disconnect, socket error).
    #[error("transport error requesting {url}: {source}")]
    Transport {
        /// The URL that failed.
        url: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// Non-transient request failure (TLS, redirect policy, body decode).
    #[error("request error for {url}: {source}")]
    Request {
        /// The URL that failed.
        url: String,
        /// The underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The retry budget was consumed by retryable response statuses.
    #[error("retries exhausted for {url}: {attempts} retries, last status {last_status}")]
    RetriesExhausted {
        /// The URL that kept failing.
        url: String,
        /// Number of retries performed.
        attempts: u32,
        /// The status code of the final attempt.
        last_status: u16,
    },

    /// The provided URL is malformed or has no host.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Constructing the underlying pooled client failed.
    #[error("failed to build HTTP session: {source}")]
    BuildSession {
        /// The builder error.
        #[source]
        source: reqwest::Error,
    },

    /// The executor was closed while requests were waiting for admission.
    #[error("executor closed while waiting for a concurrency slot")]
    Closed,

    /// A configuration value was rejected at construction time.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Human-readable description of the rejected value.
        reason: String,
    },

    /// A request body failed to serialize.
    #[error("failed to serialize request body: {source}")]
    Body {
        /// The serialization error.
        #[source]
        source: serde_json::Error,
    },
}

impl HttpError {
    /// Creates a circuit-open error.
    pub fn circuit_open(domain: impl Into<String>) -> Self {
        Self::CircuitOpen {
            domain: domain.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a transient transport error.
    pub fn transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            url: url.into(),
            source,
        }
    }

    /// Creates a non-retryable request error.
    pub fn request(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Request {
            url: url.into(),
            source,
        }
    }

    /// Creates an exhausted-retries error carrying the last observed status.
    pub fn retries_exhausted(url: impl Into<String>, attempts: u32, last_status: u16) -> Self {
        Self::RetriesExhausted {
            url: url.into(),
            attempts,
            last_status,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an invalid-configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

// Note on From trait implementations:
// No `From<reqwest::Error>` is provided because every variant requires
// context (url, domain) that the source error does not carry. The helper
// constructors are the supported way to build these errors.
