//! Per-domain token-bucket rate limiting.
//!
//! This module provides the [`RateLimiter`] struct which paces requests to
//! each domain with a token bucket: tokens refill at a steady `rate` and
//! accumulate up to `burst`, so short bursts pass immediately while sustained
//! traffic is spread out. Different domains never wait on each other.
//!
//! Admission imposes latency, never failure: [`RateLimiter::acquire`] always
//! eventually returns.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use httpguard::client::RateLimiter;
//!
//! # async fn example() {
//! // 5 requests/second steady state, bursts of up to 10.
//! let limiter = Arc::new(RateLimiter::new(5.0, 10.0));
//!
//! // Admitted immediately while burst tokens remain.
//! limiter.acquire("https://example.com").await;
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{CUMULATIVE_DELAY_WARNING_THRESHOLD, MAX_RETRY_AFTER, MIN_RATE};

/// Per-domain token-bucket rate limiter.
///
/// Designed to be wrapped in `Arc` and shared across Tokio tasks. Per-domain
/// state lives in a `DashMap`; each entry's bucket is guarded by a
/// `tokio::sync::Mutex`. The mutex is fair, and a caller that must wait
/// sleeps while holding it, so concurrent callers on one domain are admitted
/// strictly in arrival order.
///
/// The `DashMap` shard lock is released before any await by cloning the
/// entry `Arc` out of the map.
#[derive(Debug)]
pub struct RateLimiter {
    /// Default refill rate in tokens per second.
    default_rate: f64,

    /// Default burst capacity in tokens.
    default_burst: f64,

    /// Per-domain `(rate, burst)` overrides, fixed at construction.
    overrides: HashMap<String, (f64, f64)>,

    /// Per-domain bucket state, created lazily on first acquisition.
    domains: DashMap<String, Arc<DomainBucket>>,
}

/// State tracked for each domain.
#[derive(Debug)]
struct DomainBucket {
    /// Token count and refill bookkeeping, locked for the full admission
    /// (including the wait) to preserve FIFO order.
    bucket: Mutex<Bucket>,

    /// Cumulative delay imposed on this domain (milliseconds), used to warn
    /// when a domain is persistently over its budget.
    cumulative_delay_ms: AtomicU64,
}

#[derive(Debug)]
struct Bucket {
    /// Available tokens, always within `[0, burst]`.
    tokens: f64,
    /// Last refill instant; elapsed time since then earns new tokens.
    last_refill: Instant,
    /// Refill rate in tokens per second.
    rate: f64,
    /// Maximum token accumulation.
    burst: f64,
}

impl Bucket {
    fn new(rate: f64, burst: f64) -> Self {
        Self {
            tokens: burst,
            last_refill: Instant::now(),
            rate,
            burst,
        }
    }

    /// Credits tokens earned since the last refill, capped at `burst`.
    ///
    /// `last_refill` can sit in the future after a server-mandated delay, in
    /// which case no tokens are earned until that moment passes.
    fn refill(&mut self, now: Instant) {
        let elapsed = now
            .checked_duration_since(self.last_refill)
            .unwrap_or_default();
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        self.last_refill = now;
    }
}

impl DomainBucket {
    fn new(rate: f64, burst: f64) -> Self {
        Self {
            bucket: Mutex::new(Bucket::new(rate, burst)),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    /// Adds to the cumulative delay and returns the new total.
    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }
}

impl RateLimiter {
    /// Creates a rate limiter with the given default rate and burst.
    ///
    /// Rates at or below zero are clamped to a tiny positive floor so wait
    /// computation stays finite; bursts below one token are raised to one so
    /// a single request can always be admitted.
    #[must_use]
    #[instrument(skip_all, fields(rate, burst))]
    pub fn new(rate: f64, burst: f64) -> Self {
        Self::with_overrides(rate, burst, HashMap::new())
    }

    /// Creates a rate limiter with per-domain `(rate, burst)` overrides.
    ///
    /// Domains without an override use the default pair.
    #[must_use]
    pub fn with_overrides(rate: f64, burst: f64, overrides: HashMap<String, (f64, f64)>) -> Self {
        debug!(rate, burst, overrides = overrides.len(), "creating rate limiter");
        Self {
            default_rate: rate.max(MIN_RATE),
            default_burst: burst.max(1.0),
            overrides: overrides
                .into_iter()
                .map(|(domain, (rate, burst))| (domain, (rate.max(MIN_RATE), burst.max(1.0))))
                .collect(),
            domains: DashMap::new(),
        }
    }

    /// Returns the `(rate, burst)` pair that applies to a domain.
    #[must_use]
    pub fn limits_for(&self, domain: &str) -> (f64, f64) {
        self.overrides
            .get(domain)
            .copied()
            .unwrap_or((self.default_rate, self.default_burst))
    }

    /// Acquires one token for the given domain, suspending until admitted.
    ///
    /// Refills the bucket from elapsed wall-clock time; if a token is
    /// available it is consumed immediately. Otherwise the bucket is zeroed,
    /// the caller sleeps for the time one token takes to accrue, and a fresh
    /// refill pass retries admission. Queued callers on the same domain wake
    /// in arrival order.
    #[instrument(skip(self))]
    pub async fn acquire(&self, domain: &str) {
        let (rate, burst) = self.limits_for(domain);
        // Clone the Arc out so the DashMap shard lock is not held across await.
        let state = self
            .domains
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(DomainBucket::new(rate, burst)))
            .clone();

        let mut bucket = state.bucket.lock().await;
        loop {
            bucket.refill(Instant::now());
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return;
            }

            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.rate);
            bucket.tokens = 0.0;
            let cumulative = state.add_cumulative_delay(wait);

            debug!(
                domain,
                wait_ms = wait.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "rate limit wait"
            );
            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                warn!(
                    domain,
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive rate limiting - consider reducing request volume to this domain"
                );
            }

            // Sleeping with the bucket mutex held is deliberate: the fair
            // mutex queue is the per-domain FIFO wait list.
            tokio::time::sleep(wait).await;
        }
    }

    /// Folds a server-mandated delay (Retry-After) into a domain's bucket.
    ///
    /// The bucket is drained and its refill clock pushed into the future, so
    /// subsequent acquisitions wait out the server's pause before earning
    /// tokens again. Delays are capped at [`MAX_RETRY_AFTER`].
    #[instrument(skip(self))]
    pub async fn record_external_delay(&self, domain: &str, delay: Duration) {
        let (rate, burst) = self.limits_for(domain);
        let state = self
            .domains
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(DomainBucket::new(rate, burst)))
            .clone();

        let capped = delay.min(MAX_RETRY_AFTER);
        let mut bucket = state.bucket.lock().await;
        bucket.tokens = 0.0;
        bucket.last_refill = Instant::now() + capped;
        drop(bucket);

        let cumulative = state.add_cumulative_delay(capped);
        debug!(
            domain,
            delay_ms = capped.as_millis(),
            cumulative_ms = cumulative.as_millis(),
            "recorded server-mandated delay"
        );
        if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
            warn!(
                domain,
                cumulative_delay_secs = cumulative.as_secs(),
                "excessive server rate limiting - site may be under heavy load"
            );
        }
    }

    /// Current token count for a domain, if it has been seen.
    #[cfg(test)]
    async fn tokens(&self, domain: &str) -> Option<f64> {
        let state = self.domains.get(domain)?.clone();
        let bucket = state.bucket.lock().await;
        Some(bucket.tokens)
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports both RFC 7231 forms: integer seconds (`Retry-After: 120`) and
/// HTTP-date (`Retry-After: Wed, 21 Oct 2026 07:28:00 GMT`). Returns `None`
/// for unparseable or negative values; caps excessive values at one hour.
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    // Integer seconds first (most common).
    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    // HTTP-date form.
    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();
        if let Ok(duration) = datetime.duration_since(now) {
            if duration > MAX_RETRY_AFTER {
                warn!(
                    delay_secs = duration.as_secs(),
                    max_secs = MAX_RETRY_AFTER.as_secs(),
                    "Retry-After date exceeds maximum, capping at 1 hour"
                );
                return Some(MAX_RETRY_AFTER);
            }
            Some(duration)
        } else {
            debug!(header_value, "Retry-After date is in the past, returning zero");
            Some(Duration::ZERO)
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}
