//! Constants for the client module (timeouts, retry, limiter, breaker defaults).

use std::time::Duration;

/// Default per-request timeout (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default TCP connect timeout (10 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default upper bound on pooled connections tracked by the executor semaphore.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Default keep-alive connections retained per host.
pub const DEFAULT_MAX_KEEPALIVE_CONNECTIONS: usize = 10;

/// Default keep-alive idle duration before a pooled connection is dropped.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(90);

/// Default number of retries after the initial attempt.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default initial backoff delay (100ms, doubling each retry).
pub const DEFAULT_RETRY_START_TIMEOUT: Duration = Duration::from_millis(100);

/// Default bound on concurrently in-flight requests across all domains.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Default token-bucket refill rate (tokens per second).
pub const DEFAULT_RATE: f64 = 5.0;

/// Default token-bucket burst capacity.
pub const DEFAULT_BURST: f64 = 10.0;

/// Default consecutive-failure count that opens a circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default cooldown before an open circuit admits a probe request.
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP statuses retried by default (transient server errors).
pub const DEFAULT_RETRY_FOR_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// Number of recent request latencies retained for avg/min/max/p95.
pub const LATENCY_RING_CAPACITY: usize = 1000;

/// Bounded attempts at rebuilding the pooled session before giving up.
pub const DEFAULT_SESSION_BUILD_RETRIES: u32 = 3;

/// Warning threshold for cumulative rate-limit delay per domain (30 seconds).
pub const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum honored Retry-After value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Floor for configured refill rates so wait computation never divides by zero.
pub const MIN_RATE: f64 = 1e-6;
