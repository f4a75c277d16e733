//! Domain-key extraction for per-domain isolation.
//!
//! Rate limiting, circuit breaking, and per-endpoint statistics are all
//! partitioned by a `scheme://host` key derived from the request URL, so
//! traffic to unrelated services never interferes.

use url::Url;

use super::error::HttpError;

/// Derives the `scheme://host` isolation key from a parsed URL.
///
/// The host is already lowercased by the `url` crate; ports and paths are
/// deliberately excluded so `https://api.example.com:8443/v1` and
/// `https://api.example.com/v2` share one partition.
///
/// Returns `None` for URLs with no host component (e.g. `mailto:` or
/// `data:` URLs), which this client does not serve.
#[must_use]
pub fn domain_key(url: &Url) -> Option<String> {
    url.host_str()
        .map(|host| format!("{}://{host}", url.scheme()))
}

/// Parses a URL string and derives its domain key in one step.
///
/// # Errors
///
/// Returns [`HttpError::InvalidUrl`] if the string does not parse as an
/// absolute URL or has no host.
pub fn parse_domain_key(url: &str) -> Result<(Url, String), HttpError> {
    let parsed = Url::parse(url).map_err(|_| HttpError::invalid_url(url))?;
    let domain = domain_key(&parsed).ok_or_else(|| HttpError::invalid_url(url))?;
    Ok((parsed, domain))
}
