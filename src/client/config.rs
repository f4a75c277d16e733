//! Configuration for the request executor.
//!
//! All knobs recognized by [`RequestExecutor`](super::RequestExecutor) live
//! on [`ClientConfig`]: transport timeouts, pool sizing, retry policy,
//! concurrency bound, limiter defaults with per-domain overrides, and the
//! circuit-breaker thresholds. The struct is serde-(de)serializable with
//! durations expressed as fractional seconds, so a deployment can ship it
//! as JSON.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::constants::{
    DEFAULT_BURST, DEFAULT_CONNECT_TIMEOUT, DEFAULT_FAILURE_THRESHOLD,
    DEFAULT_KEEPALIVE_TIMEOUT, DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_KEEPALIVE_CONNECTIONS, DEFAULT_RATE, DEFAULT_RECOVERY_TIMEOUT,
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_FOR_STATUSES, DEFAULT_RETRY_START_TIMEOUT,
    DEFAULT_SESSION_BUILD_RETRIES, DEFAULT_TIMEOUT,
};
use super::error::HttpError;

/// Per-domain rate-limit override.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitOverride {
    /// Refill rate in tokens per second.
    pub rate: f64,
    /// Burst capacity in tokens.
    pub burst: f64,
}

/// Configuration for a [`RequestExecutor`](super::RequestExecutor).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-request timeout covering a single attempt's network I/O.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// TCP connect timeout.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Upper bound on total connections; enforced through the concurrency
    /// semaphore together with the per-host keep-alive cap.
    pub max_connections: usize,

    /// Keep-alive connections retained per host after use.
    pub max_keepalive_connections: usize,

    /// Idle duration before a pooled connection is evicted.
    #[serde(with = "duration_secs")]
    pub keepalive_timeout: Duration,

    /// Retries after the initial attempt (0 disables retrying).
    pub retry_attempts: u32,

    /// Initial backoff delay; doubles after each retry, no jitter.
    #[serde(with = "duration_secs")]
    pub retry_start_timeout: Duration,

    /// Bound on concurrently in-flight requests across all domains.
    pub max_concurrent_requests: usize,

    /// Default token-bucket refill rate (tokens per second).
    pub rate: f64,

    /// Default token-bucket burst capacity.
    pub burst: f64,

    /// Per-domain `(rate, burst)` overrides keyed by `scheme://host`.
    pub per_domain_limits: HashMap<String, RateLimitOverride>,

    /// Consecutive failures that open a domain's circuit.
    pub failure_threshold: u32,

    /// Cooldown before an open circuit admits a probe.
    #[serde(with = "duration_secs")]
    pub recovery_timeout: Duration,

    /// Response statuses retried with backoff.
    pub retry_for_statuses: BTreeSet<u16>,

    /// Bounded attempts at rebuilding the pooled session.
    pub session_build_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_keepalive_connections: DEFAULT_MAX_KEEPALIVE_CONNECTIONS,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_start_timeout: DEFAULT_RETRY_START_TIMEOUT,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            rate: DEFAULT_RATE,
            burst: DEFAULT_BURST,
            per_domain_limits: HashMap::new(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            retry_for_statuses: DEFAULT_RETRY_FOR_STATUSES.into_iter().collect(),
            session_build_retries: DEFAULT_SESSION_BUILD_RETRIES,
        }
    }
}

impl ClientConfig {
    /// Parses a config from a JSON document; absent fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns the underlying parse error for malformed JSON.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Validates values that cannot be silently clamped.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::InvalidConfig`] when a bound would make the
    /// executor inoperable (zero concurrency, zero timeout, non-positive
    /// rate).
    pub fn validate(&self) -> Result<(), HttpError> {
        if self.max_concurrent_requests == 0 {
            return Err(HttpError::invalid_config(
                "max_concurrent_requests must be at least 1",
            ));
        }
        if self.max_connections == 0 {
            return Err(HttpError::invalid_config("max_connections must be at least 1"));
        }
        if self.timeout.is_zero() {
            return Err(HttpError::invalid_config("timeout must be positive"));
        }
        if self.rate <= 0.0 {
            return Err(HttpError::invalid_config("rate must be positive"));
        }
        if self.burst < 1.0 {
            return Err(HttpError::invalid_config("burst must admit at least one token"));
        }
        Ok(())
    }

    /// Per-domain overrides in the `(rate, burst)` tuple form the limiter takes.
    #[must_use]
    pub(crate) fn limiter_overrides(&self) -> HashMap<String, (f64, f64)> {
        self.per_domain_limits
            .iter()
            .map(|(domain, limit)| (domain.clone(), (limit.rate, limit.burst)))
            .collect()
    }
}

/// Serializes `Duration` as fractional seconds, matching the float-seconds
/// convention of the options this config mirrors.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
