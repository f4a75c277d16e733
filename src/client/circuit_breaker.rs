//! Per-domain circuit breaking for failing endpoints.
//!
//! This module provides the [`CircuitBreaker`] struct, a per-domain failure
//! state machine that stops hammering an endpoint once it has failed
//! repeatedly, then lets a single probe through after a cooldown.
//!
//! # States
//!
//! - **Closed** - requests flow; failures are counted.
//! - **Open** - requests fail fast without a network call.
//! - **HalfOpen** - one probe is in flight after the recovery timeout; all
//!   other callers still observe an open circuit until the probe's outcome
//!   is recorded.
//!
//! The half-open transition happens under the domain's mutex, so exactly one
//! caller wins the probe slot even when many check the circuit concurrently.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT};

/// Observable circuit state for a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally; failures are counted.
    Closed,
    /// Requests fail fast; the endpoint is considered down.
    Open,
    /// A single trial request is outstanding after the cooldown.
    HalfOpen,
}

/// Per-domain circuit breaker.
///
/// Shared across tasks behind an `Arc`. Domain entries are created lazily on
/// the first recorded failure; a domain that has never failed reads as
/// closed without allocating state.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Consecutive failures that open a circuit.
    threshold: u32,

    /// Cooldown before an open circuit admits a probe.
    recovery_timeout: Duration,

    /// Per-domain state.
    domains: DashMap<String, Arc<DomainCircuit>>,
}

#[derive(Debug)]
struct DomainCircuit {
    inner: Mutex<CircuitInner>,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

impl DomainCircuit {
    fn new() -> Self {
        Self {
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitInner> {
        // The critical sections are tiny and never panic in release code;
        // recover the guard rather than poisoning every future request.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT)
    }
}

impl CircuitBreaker {
    /// Creates a circuit breaker with the given threshold and recovery timeout.
    ///
    /// A threshold of zero is raised to one so a circuit can only open after
    /// at least one recorded failure.
    #[must_use]
    #[instrument(skip_all, fields(threshold, recovery_ms = recovery_timeout.as_millis()))]
    pub fn new(threshold: u32, recovery_timeout: Duration) -> Self {
        debug!("creating circuit breaker");
        Self {
            threshold: threshold.max(1),
            recovery_timeout,
            domains: DashMap::new(),
        }
    }

    /// Returns the configured failure threshold.
    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Returns the configured recovery timeout.
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Records a failed outcome for a domain.
    ///
    /// Increments the failure count and stamps the failure time; once the
    /// count reaches the threshold the circuit opens. A failed half-open
    /// probe reopens the circuit immediately.
    #[instrument(skip(self))]
    pub fn record_failure(&self, domain: &str) {
        let entry = self.entry(domain);
        let mut inner = entry.lock();

        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        if inner.failure_count >= self.threshold && inner.state != CircuitState::Open {
            warn!(
                domain,
                failures = inner.failure_count,
                threshold = self.threshold,
                "circuit opened"
            );
            inner.state = CircuitState::Open;
        } else {
            debug!(domain, failures = inner.failure_count, "failure recorded");
        }
    }

    /// Records a successful outcome for a domain.
    ///
    /// Resets the failure count and closes the circuit, including after a
    /// successful half-open probe.
    #[instrument(skip(self))]
    pub fn record_success(&self, domain: &str) {
        let Some(entry) = self.domains.get(domain).map(|e| Arc::clone(&e)) else {
            return;
        };
        let mut inner = entry.lock();
        if inner.state != CircuitState::Closed {
            debug!(domain, "circuit closed after success");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
    }

    /// Returns whether requests to a domain should fail fast.
    ///
    /// `false` for closed circuits. For an open circuit whose recovery
    /// timeout has elapsed, the state flips to half-open and `false` is
    /// returned to this caller only; every other caller sees `true` until
    /// the probe's outcome is recorded.
    #[instrument(skip(self))]
    pub fn is_open(&self, domain: &str) -> bool {
        let Some(entry) = self.domains.get(domain).map(|e| Arc::clone(&e)) else {
            return false;
        };
        let mut inner = entry.lock();
        match inner.state {
            CircuitState::Closed => false,
            // A probe is already out; everyone else keeps failing fast.
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure
                    .is_some_and(|at| at.elapsed() > self.recovery_timeout);
                if cooled_down {
                    debug!(domain, "recovery timeout elapsed - admitting probe");
                    inner.state = CircuitState::HalfOpen;
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Returns the current state for a domain (closed if never seen).
    #[must_use]
    pub fn state(&self, domain: &str) -> CircuitState {
        self.domains
            .get(domain)
            .map_or(CircuitState::Closed, |entry| entry.lock().state)
    }

    /// Returns the current failure count for a domain.
    #[must_use]
    pub fn failure_count(&self, domain: &str) -> u32 {
        self.domains
            .get(domain)
            .map_or(0, |entry| entry.lock().failure_count)
    }

    fn entry(&self, domain: &str) -> Arc<DomainCircuit> {
        self.domains
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(DomainCircuit::new()))
            .clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const DOMAIN: &str = "https://example.com";

    #[test]
    fn test_unknown_domain_reads_closed() {
        let breaker = CircuitBreaker::default();
        assert!(!breaker.is_open(DOMAIN));
        assert_eq!(breaker.state(DOMAIN), CircuitState::Closed);
        assert_eq!(breaker.failure_count(DOMAIN), 0);
    }

    #[test]
    fn test_threshold_zero_raised_to_one() {
        let breaker = CircuitBreaker::new(0, Duration::from_secs(30));
        assert_eq!(breaker.threshold(), 1);
    }

    #[test]
    fn test_opens_exactly_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));

        breaker.record_failure(DOMAIN);
        breaker.record_failure(DOMAIN);
        assert!(!breaker.is_open(DOMAIN), "two failures must not open");

        breaker.record_failure(DOMAIN);
        assert!(breaker.is_open(DOMAIN), "third failure must open");
        assert_eq!(breaker.state(DOMAIN), CircuitState::Open);
        assert_eq!(breaker.failure_count(DOMAIN), 3);
    }

    #[test]
    fn test_success_resets_and_closes() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        for _ in 0..3 {
            breaker.record_failure(DOMAIN);
        }
        assert!(breaker.is_open(DOMAIN));

        breaker.record_success(DOMAIN);
        assert!(!breaker.is_open(DOMAIN));
        assert_eq!(breaker.failure_count(DOMAIN), 0);
        assert_eq!(breaker.state(DOMAIN), CircuitState::Closed);
    }

    #[test]
    fn test_domains_tracked_independently() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(30));
        breaker.record_failure("https://a.com");
        breaker.record_failure("https://a.com");

        assert!(breaker.is_open("https://a.com"));
        assert!(!breaker.is_open("https://b.com"));
    }

    #[tokio::test]
    async fn test_recovery_admits_exactly_one_probe() {
        tokio::time::pause();

        let breaker = CircuitBreaker::new(2, Duration::from_secs(1));
        breaker.record_failure(DOMAIN);
        breaker.record_failure(DOMAIN);
        assert!(breaker.is_open(DOMAIN), "open immediately after threshold");

        tokio::time::advance(Duration::from_millis(1100)).await;

        // First check after cooldown wins the probe slot.
        assert!(!breaker.is_open(DOMAIN));
        assert_eq!(breaker.state(DOMAIN), CircuitState::HalfOpen);

        // Concurrent checks still observe an open circuit.
        assert!(breaker.is_open(DOMAIN));
        assert!(breaker.is_open(DOMAIN));
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        tokio::time::pause();

        let breaker = CircuitBreaker::new(1, Duration::from_secs(1));
        breaker.record_failure(DOMAIN);
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(!breaker.is_open(DOMAIN), "probe admitted");

        breaker.record_failure(DOMAIN);
        assert_eq!(breaker.state(DOMAIN), CircuitState::Open);
        assert!(breaker.is_open(DOMAIN), "failed probe reopens immediately");
    }

    #[tokio::test]
    async fn test_successful_probe_closes() {
        tokio::time::pause();

        let breaker = CircuitBreaker::new(1, Duration::from_secs(1));
        breaker.record_failure(DOMAIN);
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(!breaker.is_open(DOMAIN), "probe admitted");

        breaker.record_success(DOMAIN);
        assert_eq!(breaker.state(DOMAIN), CircuitState::Closed);
        assert!(!breaker.is_open(DOMAIN));
    }

    #[test]
    fn test_open_implies_count_at_threshold() {
        let breaker = CircuitBreaker::new(4, Duration::from_secs(30));
        for _ in 0..10 {
            breaker.record_failure(DOMAIN);
        }
        assert_eq!(breaker.state(DOMAIN), CircuitState::Open);
        assert!(breaker.failure_count(DOMAIN) >= breaker.threshold());
    }
}
