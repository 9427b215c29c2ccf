//! Gateway cache configuration.

use serde::{Deserialize, Serialize};

/// Knobs that alter [`HttpCache`](super::HttpCache) decisions.
///
/// Every field has a default, so a JSON document only needs the fields it
/// changes.
///
/// # Examples
///
/// ```
/// use rttp_cache::CacheOptions;
///
/// let options = CacheOptions::from_json(r#"{ "default_ttl": 30, "allow_reload": true }"#).unwrap();
/// assert_eq!(options.default_ttl, 30);
/// assert!(options.allow_reload);
/// assert_eq!(options.stale_if_error, 60);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Adds the trace header to main responses and rethrows store errors.
    pub debug: bool,

    /// TTL in seconds applied to responses that carry no freshness
    /// information and no `must-revalidate`. `0` disables it.
    pub default_ttl: i64,

    /// Request headers that make a request private. `Cookie` counts only
    /// when at least one cookie parses.
    pub private_headers: Vec<String>,

    /// Lets a client `no-cache` request force a fetch from the origin.
    pub allow_reload: bool,

    /// Lets a client `max-age` request directive shorten freshness.
    pub allow_revalidate: bool,

    /// Seconds a stale entry may be served while another party
    /// revalidates it, unless the entry's own directive says otherwise.
    pub stale_while_revalidate: i64,

    /// Seconds past expiry an entry may stand in for a 5xx origin answer,
    /// unless the entry's own directive says otherwise.
    pub stale_if_error: i64,

    /// Name of the debug trace header.
    pub trace_header: String,

    /// How long to wait for a revalidation lock held elsewhere.
    pub lock_wait: LockWaitOptions,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            debug: false,
            default_ttl: 0,
            private_headers: vec!["Authorization".to_owned(), "Cookie".to_owned()],
            allow_reload: false,
            allow_revalidate: false,
            stale_while_revalidate: 2,
            stale_if_error: 60,
            trace_header: "X-Cache-Trace".to_owned(),
            lock_wait: LockWaitOptions::default(),
        }
    }
}

impl CacheOptions {
    /// Parses options from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Polling schedule used while another party holds the revalidation lock.
///
/// The poll interval starts at `tick_ms` and doubles up to eight ticks.
/// Waiting stops after `timeout_ms`; a release seen later than
/// `release_threshold_ms` is answered with a 503.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockWaitOptions {
    pub tick_ms: u64,
    pub timeout_ms: u64,
    pub release_threshold_ms: u64,
}

impl Default for LockWaitOptions {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            timeout_ms: 5000,
            release_threshold_ms: 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        assert_eq!(CacheOptions::from_json("{}").unwrap(), CacheOptions::default());
    }

    #[test]
    fn nested_lock_wait_is_partial() {
        let options = CacheOptions::from_json(r#"{"lock_wait": {"tick_ms": 5}}"#).unwrap();
        assert_eq!(options.lock_wait.tick_ms, 5);
        assert_eq!(options.lock_wait.timeout_ms, 5000);
    }

    #[test]
    fn rejects_wrong_types() {
        assert!(CacheOptions::from_json(r#"{"debug": "yes"}"#).is_err());
    }
}
