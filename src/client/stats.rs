//! Request accounting: counters, status histogram, latency percentiles.
//!
//! [`RequestStats`] is mutated concurrently by in-flight requests (atomic
//! counters, dashmap-backed per-domain sets) and read through owned
//! snapshots: [`snapshot`](RequestStats::snapshot) and
//! [`endpoint`](RequestStats::endpoint) copy every value out, so a snapshot
//! never changes after it is taken.
//!
//! Latencies are kept in a bounded ring of the most recent
//! [`LATENCY_RING_CAPACITY`] samples; avg/min/max/p95 are derived from the
//! ring at snapshot time rather than maintained incrementally.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use super::constants::LATENCY_RING_CAPACITY;

/// One set of outcome counters, global or per-domain.
#[derive(Debug, Default)]
struct CounterSet {
    requests: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    retries: AtomicU64,
    circuit_breaks: AtomicU64,
    rate_limited: AtomicU64,
    backpressure_applied: AtomicU64,
}

impl CounterSet {
    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            requests: self.requests.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            timeouts: self.timeouts.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
            circuit_breaks: self.circuit_breaks.load(Ordering::SeqCst),
            rate_limited: self.rate_limited.load(Ordering::SeqCst),
            backpressure_applied: self.backpressure_applied.load(Ordering::SeqCst),
        }
    }

    fn reset(&self) {
        self.requests.store(0, Ordering::SeqCst);
        self.errors.store(0, Ordering::SeqCst);
        self.timeouts.store(0, Ordering::SeqCst);
        self.retries.store(0, Ordering::SeqCst);
        self.circuit_breaks.store(0, Ordering::SeqCst);
        self.rate_limited.store(0, Ordering::SeqCst);
        self.backpressure_applied.store(0, Ordering::SeqCst);
    }
}

/// Copied-out counter values; plain integers, safe to hold indefinitely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Top-level calls admitted (counted once, independent of retries).
    pub requests: u64,
    /// Transient transport failures observed.
    pub errors: u64,
    /// Per-attempt timeouts observed.
    pub timeouts: u64,
    /// Retries scheduled (status-based, timeout, or transport).
    pub retries: u64,
    /// Requests rejected fast by an open circuit.
    pub circuit_breaks: u64,
    /// Limiter-internal failures (admission delay is not counted).
    pub rate_limited: u64,
    /// Calls that found no free concurrency slot and had to wait.
    pub backpressure_applied: u64,
}

/// Latency summary derived from the ring buffer at snapshot time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Number of samples currently in the ring.
    pub samples: usize,
    /// Mean latency in milliseconds.
    pub avg_ms: f64,
    /// Minimum latency in milliseconds.
    pub min_ms: f64,
    /// Maximum latency in milliseconds.
    pub max_ms: f64,
    /// 95th-percentile latency in milliseconds.
    pub p95_ms: f64,
}

/// Full accounting snapshot: totals, histogram, latency, per-domain counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Global counters across all domains.
    pub totals: CounterSnapshot,
    /// Response-status histogram.
    pub status_counts: BTreeMap<u16, u64>,
    /// Latency summary over the most recent samples.
    pub latency: LatencySummary,
    /// High-water mark of simultaneously in-flight requests.
    pub max_in_flight: u64,
    /// Per-domain counters keyed by `scheme://host`.
    pub domains: BTreeMap<String, CounterSnapshot>,
}

/// Concurrently mutated request statistics.
#[derive(Debug, Default)]
pub struct RequestStats {
    global: CounterSet,
    per_domain: DashMap<String, Arc<CounterSet>>,
    status_counts: DashMap<u16, u64>,
    latencies: Mutex<VecDeque<f64>>,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
}

/// RAII gauge for the in-flight high-water mark; decrements on drop so the
/// count stays correct on every exit path.
#[derive(Debug)]
pub(crate) struct InFlightGuard<'a> {
    stats: &'a RequestStats,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RequestStats {
    /// Creates a stats aggregate with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn domain(&self, domain: &str) -> Arc<CounterSet> {
        self.per_domain
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(CounterSet::default()))
            .clone()
    }

    /// Counts a top-level admitted call (exactly once per call).
    pub fn record_request(&self, domain: &str) {
        self.global.requests.fetch_add(1, Ordering::SeqCst);
        self.domain(domain).requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a transient transport failure.
    pub fn record_error(&self, domain: &str) {
        self.global.errors.fetch_add(1, Ordering::SeqCst);
        self.domain(domain).errors.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a per-attempt timeout.
    pub fn record_timeout(&self, domain: &str) {
        self.global.timeouts.fetch_add(1, Ordering::SeqCst);
        self.domain(domain).timeouts.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a scheduled retry.
    pub fn record_retry(&self, domain: &str) {
        self.global.retries.fetch_add(1, Ordering::SeqCst);
        self.domain(domain).retries.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a fail-fast rejection by an open circuit.
    pub fn record_circuit_break(&self, domain: &str) {
        self.global.circuit_breaks.fetch_add(1, Ordering::SeqCst);
        self.domain(domain)
            .circuit_breaks
            .fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a limiter-internal failure.
    pub fn record_rate_limited(&self, domain: &str) {
        self.global.rate_limited.fetch_add(1, Ordering::SeqCst);
        self.domain(domain)
            .rate_limited
            .fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a call that had to wait for a concurrency slot.
    pub fn record_backpressure(&self, domain: &str) {
        self.global
            .backpressure_applied
            .fetch_add(1, Ordering::SeqCst);
        self.domain(domain)
            .backpressure_applied
            .fetch_add(1, Ordering::SeqCst);
    }

    /// Records a response status in the histogram.
    pub fn record_status(&self, status: u16) {
        *self.status_counts.entry(status).or_insert(0) += 1;
    }

    /// Records one top-level call's latency, evicting the oldest sample
    /// once the ring is full.
    pub fn record_latency(&self, latency: Duration) {
        let mut ring = self.latencies.lock().unwrap_or_else(PoisonError::into_inner);
        if ring.len() == LATENCY_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(latency.as_secs_f64() * 1000.0);
    }

    /// Marks a request in flight; the guard decrements on drop.
    pub(crate) fn enter_in_flight(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { stats: self }
    }

    /// Takes a full snapshot; the result never changes afterwards.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            totals: self.global.snapshot(),
            status_counts: self
                .status_counts
                .iter()
                .map(|entry| (*entry.key(), *entry.value()))
                .collect(),
            latency: self.latency_summary(),
            max_in_flight: self.max_in_flight.load(Ordering::SeqCst),
            domains: self
                .per_domain
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().snapshot()))
                .collect(),
        }
    }

    /// Per-domain counters, optionally filtered to one domain.
    ///
    /// A domain that has never been seen yields an empty map rather than a
    /// zeroed entry.
    #[must_use]
    pub fn endpoint(&self, domain: Option<&str>) -> BTreeMap<String, CounterSnapshot> {
        match domain {
            Some(domain) => self
                .per_domain
                .get(domain)
                .map(|entry| (domain.to_string(), entry.snapshot()))
                .into_iter()
                .collect(),
            None => self
                .per_domain
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().snapshot()))
                .collect(),
        }
    }

    /// Zeroes every counter, the histogram, the ring, and the high-water mark.
    pub fn reset(&self) {
        debug!("resetting request statistics");
        self.global.reset();
        self.per_domain.clear();
        self.status_counts.clear();
        self.latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.max_in_flight.store(0, Ordering::SeqCst);
    }

    fn latency_summary(&self) -> LatencySummary {
        let ring = self.latencies.lock().unwrap_or_else(PoisonError::into_inner);
        if ring.is_empty() {
            return LatencySummary::default();
        }

        let mut sorted: Vec<f64> = ring.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        let samples = sorted.len();
        #[allow(clippy::cast_precision_loss)]
        let avg_ms = sorted.iter().sum::<f64>() / samples as f64;
        // Nearest-rank p95: ceil(0.95 * n) as a 1-based rank.
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let p95_index = ((samples as f64 * 0.95).ceil() as usize).clamp(1, samples) - 1;

        LatencySummary {
            samples,
            avg_ms,
            min_ms: sorted[0],
            max_ms: sorted[samples - 1],
            p95_ms: sorted[p95_index],
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    const DOMAIN: &str = "https://example.com";

    #[test]
    fn test_request_counts_global_and_domain() {
        let stats = RequestStats::new();
        stats.record_request(DOMAIN);
        stats.record_request(DOMAIN);
        stats.record_request("https://other.com");

        let snap = stats.snapshot();
        assert_eq!(snap.totals.requests, 3);
        assert_eq!(snap.domains[DOMAIN].requests, 2);
        assert_eq!(snap.domains["https://other.com"].requests, 1);
    }

    #[test]
    fn test_snapshot_isolation() {
        let stats = RequestStats::new();
        stats.record_request(DOMAIN);
        stats.record_status(200);

        let before = stats.snapshot();
        stats.record_request(DOMAIN);
        stats.record_status(200);
        stats.record_retry(DOMAIN);

        // The earlier snapshot must be unaffected by later mutation.
        assert_eq!(before.totals.requests, 1);
        assert_eq!(before.totals.retries, 0);
        assert_eq!(before.status_counts[&200], 1);

        let after = stats.snapshot();
        assert_eq!(after.totals.requests, 2);
        assert_eq!(after.totals.retries, 1);
    }

    #[test]
    fn test_status_histogram() {
        let stats = RequestStats::new();
        stats.record_status(200);
        stats.record_status(200);
        stats.record_status(503);

        let snap = stats.snapshot();
        assert_eq!(snap.status_counts[&200], 2);
        assert_eq!(snap.status_counts[&503], 1);
        assert!(!snap.status_counts.contains_key(&404));
    }

    #[test]
    fn test_latency_summary_values() {
        let stats = RequestStats::new();
        for ms in [10u64, 20, 30, 40] {
            stats.record_latency(Duration::from_millis(ms));
        }

        let latency = stats.snapshot().latency;
        assert_eq!(latency.samples, 4);
        assert_eq!(latency.min_ms, 10.0);
        assert_eq!(latency.max_ms, 40.0);
        assert_eq!(latency.avg_ms, 25.0);
        // Nearest rank: ceil(4 * 0.95) = 4th value.
        assert_eq!(latency.p95_ms, 40.0);
    }

    #[test]
    fn test_latency_p95_hundred_samples() {
        let stats = RequestStats::new();
        for ms in 1..=100u64 {
            stats.record_latency(Duration::from_millis(ms));
        }
        let latency = stats.snapshot().latency;
        assert_eq!(latency.p95_ms, 95.0);
    }

    #[test]
    fn test_latency_ring_bounded() {
        let stats = RequestStats::new();
        for ms in 0..(LATENCY_RING_CAPACITY as u64 + 100) {
            stats.record_latency(Duration::from_millis(ms));
        }

        let latency = stats.snapshot().latency;
        assert_eq!(latency.samples, LATENCY_RING_CAPACITY);
        // The oldest 100 samples were evicted.
        assert_eq!(latency.min_ms, 100.0);
    }

    #[test]
    fn test_empty_latency_summary_is_zeroed() {
        let stats = RequestStats::new();
        assert_eq!(stats.snapshot().latency, LatencySummary::default());
    }

    #[test]
    fn test_endpoint_filter() {
        let stats = RequestStats::new();
        stats.record_request(DOMAIN);
        stats.record_request("https://other.com");

        let one = stats.endpoint(Some(DOMAIN));
        assert_eq!(one.len(), 1);
        assert_eq!(one[DOMAIN].requests, 1);

        let all = stats.endpoint(None);
        assert_eq!(all.len(), 2);

        assert!(stats.endpoint(Some("https://unseen.com")).is_empty());
    }

    #[test]
    fn test_reset_clears_everything() {
        let stats = RequestStats::new();
        stats.record_request(DOMAIN);
        stats.record_status(200);
        stats.record_latency(Duration::from_millis(5));
        let _guard = stats.enter_in_flight();
        drop(_guard);

        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.totals, CounterSnapshot::default());
        assert!(snap.status_counts.is_empty());
        assert_eq!(snap.latency.samples, 0);
        assert_eq!(snap.max_in_flight, 0);
        assert!(snap.domains.is_empty());
    }

    #[test]
    fn test_in_flight_high_water_mark() {
        let stats = RequestStats::new();
        let a = stats.enter_in_flight();
        let b = stats.enter_in_flight();
        drop(a);
        let c = stats.enter_in_flight();
        drop(b);
        drop(c);

        assert_eq!(stats.snapshot().max_in_flight, 2);
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let stats = RequestStats::new();
        stats.record_request(DOMAIN);
        stats.record_status(200);

        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"requests\":1"));
        assert!(json.contains("\"200\":1"));
    }
}
