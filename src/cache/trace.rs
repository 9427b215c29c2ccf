//! Per-request record of cache decisions.

use std::fmt;

use serde::Serialize;

use crate::Request;

/// A decision the cache took for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheEvent {
    Fresh,
    Stale,
    Miss,
    Store,
    StoreFailed,
    Pass,
    Reload,
    Invalidate,
    InvalidateFailed,
    LookupFailed,
    Valid,
    Invalid,
    StaleIfError,
    StaleWhileRevalidate,
}

impl CacheEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Miss => "miss",
            Self::Store => "store",
            Self::StoreFailed => "store-failed",
            Self::Pass => "pass",
            Self::Reload => "reload",
            Self::Invalidate => "invalidate",
            Self::InvalidateFailed => "invalidate-failed",
            Self::LookupFailed => "lookup-failed",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::StaleIfError => "stale-if-error",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events grouped by request, in the order requests were first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    entries: Vec<(String, Vec<CacheEvent>)>,
}

impl Trace {
    /// Appends `event` under `key`.
    pub fn record(&mut self, key: String, event: CacheEvent) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, events)) => events.push(event),
            None => self.entries.push((key, vec![event])),
        }
    }

    /// Returns the events recorded for `key` (see [`trace_key`]).
    pub fn events(&self, key: &str) -> &[CacheEvent] {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map_or(&[], |(_, events)| events.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[CacheEvent])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the trace as `GET /: miss, store; GET /foo: fresh`.
    pub fn log(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, events)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{key}: ")?;
            for (j, event) in events.iter().enumerate() {
                if j > 0 {
                    f.write_str(", ")?;
                }
                f.write_str(event.as_str())?;
            }
        }
        Ok(())
    }
}

/// `METHOD path[?query]`, the key requests are traced under.
pub fn trace_key(request: &Request) -> String {
    match request.query_string().filter(|q| !q.is_empty()) {
        Some(query) => format!("{} {}?{}", request.method(), request.path(), query),
        None => format!("{} {}", request.method(), request.path()),
    }
}
