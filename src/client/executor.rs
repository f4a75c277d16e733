//! Request executor: the resilient facade over the pooled session.
//!
//! [`RequestExecutor`] composes the session pool, the per-domain rate
//! limiter, the per-domain circuit breaker, a process-wide concurrency
//! semaphore, and request statistics into one orchestration shared by
//! [`get`](RequestExecutor::get), [`post`](RequestExecutor::post), and
//! [`download`](RequestExecutor::download):
//!
//! 1. Derive the `scheme://host` domain key.
//! 2. Admit through the semaphore (backpressure is accounted, never an error).
//! 3. Fail fast if the domain's circuit is open.
//! 4. Acquire a rate-limiter token.
//! 5. Run the attempt loop: exponential backoff without jitter, retrying
//!    retryable statuses, timeouts, and transient transport failures until
//!    the budget is consumed.
//! 6. Feed the outcome to the circuit breaker and record latency.
//!
//! `download` shares the orchestration but streams the body to a file and
//! reports success as a plain `bool` instead of raising.
//!
//! # Example
//!
//! ```no_run
//! use httpguard::client::{ClientConfig, RequestExecutor, RequestOptions};
//!
//! # async fn example() -> Result<(), httpguard::client::HttpError> {
//! let executor = RequestExecutor::new(ClientConfig::default())?;
//! let response = executor
//!     .get("https://api.example.com/v1/status", &RequestOptions::default())
//!     .await?;
//! println!("status: {}", response.status());
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::circuit_breaker::CircuitBreaker;
use super::config::ClientConfig;
use super::constants::MAX_RETRY_AFTER;
use super::domain;
use super::error::HttpError;
use super::pool::SessionPool;
use super::rate_limiter::{RateLimiter, parse_retry_after};
use super::stats::{CounterSnapshot, InFlightGuard, RequestStats, StatsSnapshot};

/// Per-call options shared by `get`, `post`, and `download`.
///
/// All fields are optional; `RequestOptions::default()` issues a plain
/// request under the executor's configured policy.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Query parameters appended to the URL.
    pub params: Vec<(String, String)>,

    /// Extra request headers.
    pub headers: Option<HeaderMap>,

    /// Per-call timeout overriding the configured request timeout. Bounds a
    /// single attempt's network I/O, not the cumulative retry sequence.
    pub timeout: Option<Duration>,

    /// Statuses retried for this call, overriding the configured set.
    pub retry_for_statuses: Option<BTreeSet<u16>>,

    /// Skip the circuit-breaker check for this call.
    pub no_circuit_breaker: bool,

    /// Skip rate-limiter admission for this call.
    pub no_rate_limit: bool,
}

/// Request body plus the content type it carries.
#[derive(Debug)]
struct Payload {
    bytes: Vec<u8>,
    content_type: Option<&'static str>,
}

/// Admission state for one top-level call: the concurrency permit and the
/// in-flight gauge entry.
///
/// Both are RAII guards, released together when this struct drops. `get` and
/// `post` drop it when they hand the response to the caller; `download`
/// keeps it alive until the body is fully streamed, so streaming counts
/// against the concurrency bound.
#[derive(Debug)]
struct Admission<'a> {
    _permit: OwnedSemaphorePermit,
    _in_flight: InFlightGuard<'a>,
}

/// How a failed send attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptFailure {
    /// The attempt's I/O timed out; retry within budget.
    Timeout,
    /// Connection-level failure (reset, refused, disconnect); retry within budget.
    Transient,
    /// Anything else; surface immediately.
    Fatal,
}

/// Resilient request executor over a pooled HTTP session.
///
/// Owns the concurrency semaphore and the statistics aggregate exclusively;
/// the rate limiter and circuit breaker are `Arc`-shared so callers may
/// inject pre-built instances (or share them between executors).
#[derive(Debug)]
pub struct RequestExecutor {
    config: ClientConfig,
    pool: SessionPool,
    rate_limiter: Arc<RateLimiter>,
    circuit_breaker: Arc<CircuitBreaker>,
    semaphore: Arc<Semaphore>,
    stats: RequestStats,
}

impl RequestExecutor {
    /// Creates an executor, building the limiter and breaker from config.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::InvalidConfig`] for inoperable configuration
    /// values (zero concurrency, zero timeout, non-positive rate).
    pub fn new(config: ClientConfig) -> Result<Self, HttpError> {
        let rate_limiter = Arc::new(RateLimiter::with_overrides(
            config.rate,
            config.burst,
            config.limiter_overrides(),
        ));
        let circuit_breaker = Arc::new(CircuitBreaker::new(
            config.failure_threshold,
            config.recovery_timeout,
        ));
        Self::with_components(config, rate_limiter, circuit_breaker)
    }

    /// Creates an executor around injected limiter and breaker instances.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::InvalidConfig`] for inoperable configuration values.
    #[instrument(skip_all, fields(max_concurrent = config.max_concurrent_requests))]
    pub fn with_components(
        config: ClientConfig,
        rate_limiter: Arc<RateLimiter>,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, HttpError> {
        config.validate()?;
        debug!(
            retry_attempts = config.retry_attempts,
            threshold = circuit_breaker.threshold(),
            "creating request executor"
        );
        Ok(Self {
            pool: SessionPool::new(&config),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            stats: RequestStats::new(),
            rate_limiter,
            circuit_breaker,
            config,
        })
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the shared rate limiter.
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Returns the shared circuit breaker.
    #[must_use]
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    /// Returns the session pool (for `fresh_session` access).
    #[must_use]
    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Issues a GET request under the full resilience pipeline.
    ///
    /// Responses with non-retryable statuses (including 4xx/5xx outside the
    /// retry set) are returned as ordinary responses, not errors.
    ///
    /// # Errors
    ///
    /// [`HttpError::CircuitOpen`] when failing fast, [`HttpError::Timeout`] /
    /// [`HttpError::Transport`] when the retry budget is consumed by I/O
    /// failures, [`HttpError::RetriesExhausted`] when it is consumed by
    /// retryable statuses, [`HttpError::InvalidUrl`] for unparseable URLs.
    #[instrument(skip(self, options), fields(url = %url))]
    pub async fn get(&self, url: &str, options: &RequestOptions) -> Result<Response, HttpError> {
        self.execute(Method::GET, url, None, options).await
    }

    /// Issues a POST request with an optional raw body.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    #[instrument(skip(self, body, options), fields(url = %url))]
    pub async fn post(
        &self,
        url: &str,
        body: Option<Vec<u8>>,
        options: &RequestOptions,
    ) -> Result<Response, HttpError> {
        let payload = body.map(|bytes| Payload {
            bytes,
            content_type: None,
        });
        self.execute(Method::POST, url, payload, options).await
    }

    /// Issues a POST request with a JSON-serialized body.
    ///
    /// # Errors
    ///
    /// [`HttpError::Body`] if serialization fails, otherwise the same as
    /// [`get`](Self::get).
    #[instrument(skip(self, body, options), fields(url = %url))]
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        options: &RequestOptions,
    ) -> Result<Response, HttpError> {
        let bytes = serde_json::to_vec(body).map_err(|source| HttpError::Body { source })?;
        let payload = Some(Payload {
            bytes,
            content_type: Some("application/json"),
        });
        self.execute(Method::POST, url, payload, options).await
    }

    /// Downloads a URL to a file, streaming the body in chunks.
    ///
    /// Returns `true` only for a fully written 200 response. Every failure
    /// path - invalid URL, open circuit, exhausted retries, non-200 status,
    /// stream or write error - returns `false` instead of raising; streaming
    /// callers prefer a plain success flag. A partially written file is
    /// removed on stream failure.
    #[instrument(skip(self, options), fields(url = %url, dest = %destination.display()))]
    pub async fn download(&self, url: &str, destination: &Path, options: &RequestOptions) -> bool {
        // The admission guards stay alive until streaming finishes, so a
        // download occupies its concurrency slot for the body transfer too.
        let (response, _admission) = match self.execute_admitted(Method::GET, url, None, options).await
        {
            Ok(admitted) => admitted,
            Err(error) => {
                warn!(%error, "download failed before streaming");
                return false;
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            warn!(status = status.as_u16(), "download aborted: non-200 response");
            return false;
        }

        match stream_to_file(response, destination).await {
            Ok(bytes) => {
                info!(bytes, "download complete");
                true
            }
            Err(error) => {
                warn!(%error, "download stream failed - removing partial file");
                let _ = tokio::fs::remove_file(destination).await;
                false
            }
        }
    }

    /// Takes a full statistics snapshot (isolated copy).
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Per-domain counters, optionally filtered to one domain.
    #[must_use]
    pub fn endpoint_stats(
        &self,
        domain: Option<&str>,
    ) -> std::collections::BTreeMap<String, CounterSnapshot> {
        self.stats.endpoint(domain)
    }

    /// Zeroes all statistics.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Releases the pooled session; idempotent.
    ///
    /// In-flight requests finish on their cloned client handles, and the
    /// next request transparently rebuilds the pool.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Shared orchestration for `get` and `post`.
    ///
    /// The admission guards drop on return; the caller owns the response
    /// body from there.
    async fn execute(
        &self,
        method: Method,
        url: &str,
        payload: Option<Payload>,
        options: &RequestOptions,
    ) -> Result<Response, HttpError> {
        self.execute_admitted(method, url, payload, options)
            .await
            .map(|(response, _admission)| response)
    }

    /// Shared orchestration for all request variants, returning the
    /// admission guards alongside the response so `download` can hold its
    /// concurrency slot across body streaming.
    async fn execute_admitted(
        &self,
        method: Method,
        url: &str,
        payload: Option<Payload>,
        options: &RequestOptions,
    ) -> Result<(Response, Admission<'_>), HttpError> {
        let (parsed_url, domain) = domain::parse_domain_key(url)?;

        // Backpressure admission. The permit is an RAII guard: released on
        // every exit path, never retained across retries of a later call.
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(HttpError::Closed),
            Err(TryAcquireError::NoPermits) => {
                self.stats.record_backpressure(&domain);
                debug!(domain, "concurrency limit reached - waiting for a slot");
                Arc::clone(&self.semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| HttpError::Closed)?
            }
        };
        let admission = Admission {
            _permit: permit,
            _in_flight: self.stats.enter_in_flight(),
        };

        // Fail fast before consuming a limiter token or touching the network.
        if !options.no_circuit_breaker && self.circuit_breaker.is_open(&domain) {
            self.stats.record_circuit_break(&domain);
            debug!(domain, "circuit open - failing fast");
            return Err(HttpError::circuit_open(domain));
        }

        if !options.no_rate_limit {
            self.rate_limiter.acquire(&domain).await;
        }

        // Counted exactly once per top-level call, regardless of retries.
        self.stats.record_request(&domain);

        let client = self
            .pool
            .session_with_retry(self.config.session_build_retries)?;
        let retry_statuses = options
            .retry_for_statuses
            .as_ref()
            .unwrap_or(&self.config.retry_for_statuses);

        let mut retries_left = self.config.retry_attempts;
        let mut backoff = self.config.retry_start_timeout;
        let started = Instant::now();

        let outcome = loop {
            let request =
                self.build_request(&client, &method, &parsed_url, payload.as_ref(), options);

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    self.stats.record_status(status);

                    if retry_statuses.contains(&status) {
                        if retries_left > 0 {
                            retries_left -= 1;
                            self.stats.record_retry(&domain);
                            let pause =
                                self.retry_pause(&domain, backoff, response.headers()).await;
                            debug!(
                                domain,
                                status,
                                retries_left,
                                pause_ms = pause.as_millis(),
                                "retryable status - backing off"
                            );
                            drop(response);
                            tokio::time::sleep(pause).await;
                            backoff = backoff.saturating_mul(2);
                            continue;
                        }
                        warn!(domain, status, "retry budget exhausted");
                        self.circuit_breaker.record_failure(&domain);
                        break Err(HttpError::retries_exhausted(
                            url,
                            self.config.retry_attempts,
                            status,
                        ));
                    }

                    if status < 500 {
                        self.circuit_breaker.record_success(&domain);
                    } else {
                        self.circuit_breaker.record_failure(&domain);
                    }
                    break Ok(response);
                }
                Err(error) => match classify_send_error(&error) {
                    AttemptFailure::Timeout => {
                        self.stats.record_timeout(&domain);
                        if retries_left > 0 {
                            retries_left -= 1;
                            self.stats.record_retry(&domain);
                            warn!(domain, retries_left, "attempt timed out - backing off");
                            tokio::time::sleep(backoff).await;
                            backoff = backoff.saturating_mul(2);
                            continue;
                        }
                        self.circuit_breaker.record_failure(&domain);
                        break Err(HttpError::timeout(url));
                    }
                    AttemptFailure::Transient => {
                        self.stats.record_error(&domain);
                        if retries_left > 0 {
                            retries_left -= 1;
                            self.stats.record_retry(&domain);
                            warn!(
                                domain,
                                retries_left,
                                %error,
                                "transient transport failure - backing off"
                            );
                            tokio::time::sleep(backoff).await;
                            backoff = backoff.saturating_mul(2);
                            continue;
                        }
                        self.circuit_breaker.record_failure(&domain);
                        break Err(HttpError::transport(url, error));
                    }
                    AttemptFailure::Fatal => {
                        self.circuit_breaker.record_failure(&domain);
                        break Err(HttpError::request(url, error));
                    }
                },
            }
        };

        self.stats.record_latency(started.elapsed());
        outcome.map(|response| (response, admission))
    }

    fn build_request(
        &self,
        client: &Client,
        method: &Method,
        url: &Url,
        payload: Option<&Payload>,
        options: &RequestOptions,
    ) -> reqwest::RequestBuilder {
        let mut request = client.request(method.clone(), url.clone());
        if !options.params.is_empty() {
            request = request.query(&options.params);
        }
        if let Some(headers) = &options.headers {
            request = request.headers(headers.clone());
        }
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }
        if let Some(payload) = payload {
            if let Some(content_type) = payload.content_type {
                request = request.header(CONTENT_TYPE, content_type);
            }
            request = request.body(payload.bytes.clone());
        }
        request
    }

    /// Backoff for a retryable status, honoring a parseable Retry-After.
    ///
    /// A server-mandated delay extends (never shortens) the exponential
    /// backoff and is folded into the domain's rate-limit bucket so later
    /// calls respect it too.
    async fn retry_pause(&self, domain: &str, backoff: Duration, headers: &HeaderMap) -> Duration {
        let server_delay = headers
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);

        match server_delay {
            Some(delay) => {
                let capped = delay.min(MAX_RETRY_AFTER);
                self.rate_limiter
                    .record_external_delay(domain, capped)
                    .await;
                backoff.max(capped)
            }
            None => backoff,
        }
    }
}

/// Classifies a send failure into retry behavior.
fn classify_send_error(error: &reqwest::Error) -> AttemptFailure {
    if error.is_timeout() {
        return AttemptFailure::Timeout;
    }
    if error.is_connect() || has_transient_io_source(error) {
        return AttemptFailure::Transient;
    }
    AttemptFailure::Fatal
}

/// Walks the error chain looking for an OS-level socket failure of a kind
/// that a retry can plausibly fix.
fn has_transient_io_source(error: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(error);
    while let Some(current) = source {
        if let Some(io) = current.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        source = current.source();
    }
    false
}

/// Streams a response body to a file, returning bytes written.
async fn stream_to_file(response: Response, destination: &Path) -> std::io::Result<u64> {
    let file = File::create(destination).await?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(std::io::Error::other)?;
        writer.write_all(&chunk).await?;
        bytes_written += chunk.len() as u64;
    }

    writer.flush().await?;
    Ok(bytes_written)
}
