//! Lazily constructed, process-wide pooled HTTP session.
//!
//! This module provides the [`SessionPool`] struct wrapping a single
//! `reqwest::Client` configured for connection reuse: keep-alive pooling
//! with a per-host idle cap, an idle timeout that evicts stale connections,
//! gzip decompression, cached DNS resolution (hickory), and an identifying
//! User-Agent.
//!
//! Construction is lazy and double-checked: the first caller that needs a
//! session builds it under a write lock; concurrent first-callers re-check
//! after acquiring the lock so exactly one client is built. [`SessionPool::close`]
//! is idempotent and drops the pooled client, releasing its connections;
//! the next session request transparently rebuilds it.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, instrument, warn};

use super::config::ClientConfig;
use super::error::HttpError;

/// Project URL for User-Agent identification (good citizenship; RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/httpguard/httpguard";

/// Default User-Agent identifying this client.
#[must_use]
fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("httpguard/{version} (+{PROJECT_UA_URL})")
}

/// Lazily built pooled network session.
///
/// Cheap to construct; the underlying `reqwest::Client` is only built when
/// first requested. Handing out a session clones the client handle, which
/// shares the same connection pool, so callers never hold the pool's lock
/// across network I/O.
#[derive(Debug)]
pub struct SessionPool {
    config: PoolSettings,
    session: RwLock<Option<Client>>,
}

/// Transport settings captured from [`ClientConfig`] at construction.
#[derive(Debug, Clone)]
pub(crate) struct PoolSettings {
    pub(crate) timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) max_keepalive_connections: usize,
    pub(crate) keepalive_timeout: Duration,
}

impl SessionPool {
    /// Creates a pool with the transport settings from a client config.
    ///
    /// No client is built until the first [`session`](Self::session) call.
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            config: PoolSettings {
                timeout: config.timeout,
                connect_timeout: config.connect_timeout,
                max_keepalive_connections: config.max_keepalive_connections,
                keepalive_timeout: config.keepalive_timeout,
            },
            session: RwLock::new(None),
        }
    }

    /// Returns the pooled session, building it on first use.
    ///
    /// Double-checked: an uncontended read-lock check serves the common
    /// case; the write lock re-checks before constructing so concurrent
    /// first-callers cannot race to build duplicate clients.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::BuildSession`] if the client builder fails.
    pub fn session(&self) -> Result<Client, HttpError> {
        if let Some(client) = self
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Ok(client.clone());
        }

        let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
        // Re-check: another caller may have built it while we waited.
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        debug!("building pooled HTTP session");
        let client = self.build_pooled()?;
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Returns the pooled session, retrying construction on failure.
    ///
    /// A concurrently torn-down pool or a transient builder failure is
    /// retried up to `attempts` times before the last error propagates.
    ///
    /// # Errors
    ///
    /// Returns the final [`HttpError::BuildSession`] after all attempts fail.
    #[instrument(skip(self))]
    pub fn session_with_retry(&self, attempts: u32) -> Result<Client, HttpError> {
        let attempts = attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.session() {
                Ok(client) => return Ok(client),
                Err(error) => {
                    warn!(attempt, attempts, %error, "session construction failed");
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or(HttpError::Closed))
    }

    /// Builds a fresh, unpooled session.
    ///
    /// The returned client keeps no idle connections, so callers that must
    /// not be affected by concurrent pool teardown get full isolation.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::BuildSession`] if the client builder fails.
    pub fn fresh_session(&self) -> Result<Client, HttpError> {
        debug!("building fresh unpooled session");
        self.builder()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|source| HttpError::BuildSession { source })
    }

    /// Releases the pooled session and its connections.
    ///
    /// Idempotent; safe to call repeatedly or never. Requests already
    /// holding a cloned client handle finish normally, and the next session
    /// request rebuilds the pool.
    pub fn close(&self) {
        let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
        if slot.take().is_some() {
            debug!("pooled HTTP session closed");
        }
    }

    /// Whether a pooled client currently exists.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn build_pooled(&self) -> Result<Client, HttpError> {
        self.builder()
            .pool_max_idle_per_host(self.config.max_keepalive_connections)
            .pool_idle_timeout(self.config.keepalive_timeout)
            .build()
            .map_err(|source| HttpError::BuildSession { source })
    }

    fn builder(&self) -> reqwest::ClientBuilder {
        Client::builder()
            .timeout(self.config.timeout)
            .connect_timeout(self.config.connect_timeout)
            .gzip(true)
            .hickory_dns(true)
            .user_agent(default_user_agent())
    }
}
