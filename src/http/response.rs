//! HTTP/1.1 responses.
//!
//! Provides a fluent builder API for constructing HTTP responses, the HTTP
//! caching model used by the gateway cache (age, freshness lifetime,
//! cacheability, conditional matching), and serialization to a byte buffer
//! for transmission over TCP.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};

use super::date::{format_http_date, parse_http_date};
use super::{CacheControl, Headers, Method, Request, StatusCode};

/// Status codes a shared cache may store without explicit permission.
const CACHEABLE_STATUSES: [u16; 7] = [200, 203, 300, 301, 302, 404, 410];

/// Headers that must not accompany a `304 Not Modified`.
const NOT_MODIFIED_STRIPPED: [&str; 7] = [
    "Allow",
    "Content-Encoding",
    "Content-Language",
    "Content-Length",
    "Content-MD5",
    "Content-Type",
    "Last-Modified",
];

/// An HTTP/1.1 response.
///
/// # Examples
///
/// ```
/// use rttp_cache::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
            keep_alive: true,
        }
    }

    /// Creates a response from stored parts.
    pub fn from_parts(status: StatusCode, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            keep_alive: true,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for pipelines that receive a
    /// `Response` from downstream and need to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into().into_bytes();
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Replaces the status code.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response headers for modification.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the body bytes.
    pub fn content(&self) -> &[u8] {
        &self.body
    }

    /// Replaces the body.
    pub fn set_content(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    // ── Cache-Control ─────────────────────────────────────────────────────

    /// Returns the parsed `Cache-Control` directives.
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers.get_joined("cache-control").unwrap_or_default())
    }

    fn update_cache_control(&mut self, update: impl FnOnce(&mut CacheControl)) {
        let mut cc = self.cache_control();
        update(&mut cc);
        if cc.is_empty() {
            self.headers.remove("cache-control");
        } else {
            self.headers.set("Cache-Control", cc.to_string());
        }
    }

    /// Marks the response as "private": it must not be served to other clients.
    pub fn set_private(&mut self) {
        self.update_cache_control(|cc| {
            cc.remove("public");
            cc.set("private", None);
        });
    }

    /// Marks the response as "public": it may be served to other clients.
    pub fn set_public(&mut self) {
        self.update_cache_control(|cc| {
            cc.remove("private");
            cc.set("public", None);
        });
    }

    /// Sets the `max-age` directive.
    pub fn set_max_age(&mut self, seconds: i64) {
        self.update_cache_control(|cc| cc.set("max-age", Some(seconds.to_string())));
    }

    /// Sets the `s-maxage` directive and marks the response public.
    pub fn set_shared_max_age(&mut self, seconds: i64) {
        self.set_public();
        self.update_cache_control(|cc| cc.set("s-maxage", Some(seconds.to_string())));
    }

    /// Returns `true` when caches must revalidate before serving the
    /// response stale.
    pub fn must_revalidate(&self) -> bool {
        let cc = self.cache_control();
        cc.has("must-revalidate") || cc.has("proxy-revalidate")
    }

    // ── Dates and age ─────────────────────────────────────────────────────

    /// Returns the `Date` header, if present and parseable.
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.headers.get("date").and_then(parse_http_date)
    }

    /// Sets the `Date` header.
    pub fn set_date(&mut self, date: DateTime<Utc>) {
        self.headers.set("Date", format_http_date(date));
    }

    /// Returns the age of the response in seconds.
    ///
    /// An explicit `Age` header wins; otherwise the age is the time elapsed
    /// since `Date`, never negative. A response without `Date` has age 0.
    pub fn age(&self, now: DateTime<Utc>) -> i64 {
        if let Some(age) = self.headers.get("age").and_then(|a| a.trim().parse::<i64>().ok()) {
            return age;
        }
        self.date()
            .map(|date| (now - date).num_seconds().max(0))
            .unwrap_or(0)
    }

    /// Returns the freshness lifetime in seconds.
    ///
    /// `s-maxage` wins over `max-age`, which wins over `Expires - Date`.
    /// An unparseable `Expires` counts as already expired.
    pub fn max_age(&self) -> Option<i64> {
        let cc = self.cache_control();
        if let Some(age) = cc.seconds("s-maxage") {
            return Some(age);
        }
        if let Some(age) = cc.seconds("max-age") {
            return Some(age);
        }
        let expires = self.headers.get("expires")?;
        let Some(expires) = parse_http_date(expires) else {
            return Some(0);
        };
        self.date().map(|date| (expires - date).num_seconds())
    }

    /// Returns the remaining time-to-live in seconds, or `None` when the
    /// response carries no freshness information.
    pub fn ttl(&self, now: DateTime<Utc>) -> Option<i64> {
        self.max_age().map(|max_age| max_age - self.age(now))
    }

    /// Sets the shared-cache TTL by adjusting `s-maxage`.
    pub fn set_ttl(&mut self, seconds: i64, now: DateTime<Utc>) {
        let age = self.age(now);
        self.set_shared_max_age(age + seconds);
    }

    /// Sets the client TTL by adjusting `max-age`.
    pub fn set_client_ttl(&mut self, seconds: i64, now: DateTime<Utc>) {
        let age = self.age(now);
        self.set_max_age(age + seconds);
    }

    /// A response is fresh while its TTL is positive.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.ttl(now).is_some_and(|ttl| ttl > 0)
    }

    /// Returns `true` when the response carries a validator (`ETag` or
    /// `Last-Modified`) usable in a conditional request.
    pub fn is_validateable(&self) -> bool {
        self.headers.contains("last-modified") || self.headers.contains("etag")
    }

    /// Returns `true` when a shared cache may store this response.
    ///
    /// The status must be one of 200, 203, 300, 301, 302, 404, 410; `no-store`
    /// and `private` forbid storage; and the response must be either fresh or
    /// validateable.
    pub fn is_cacheable(&self, now: DateTime<Utc>) -> bool {
        if !CACHEABLE_STATUSES.contains(&self.status.as_u16()) {
            return false;
        }
        let cc = self.cache_control();
        if cc.has("no-store") || cc.has("private") {
            return false;
        }
        self.is_validateable() || self.is_fresh(now)
    }

    /// Marks a fresh response stale by setting `Age` to its freshness lifetime.
    pub fn expire(&mut self, now: DateTime<Utc>) {
        if self.is_fresh(now) {
            if let Some(max_age) = self.max_age() {
                self.headers.set("Age", max_age.to_string());
            }
        }
    }

    // ── Validators ────────────────────────────────────────────────────────

    /// Returns the literal `ETag` header.
    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag")
    }

    /// Sets or clears the `ETag` header, quoting bare tags.
    pub fn set_etag(&mut self, etag: Option<&str>) {
        match etag {
            None => {
                self.headers.remove("etag");
            }
            Some(tag) if tag.starts_with('"') || tag.starts_with("W/") => {
                self.headers.set("ETag", tag)
            }
            Some(tag) => self.headers.set("ETag", format!("\"{tag}\"")),
        }
    }

    /// Returns the literal `Last-Modified` header.
    pub fn last_modified(&self) -> Option<&str> {
        self.headers.get("last-modified")
    }

    /// Returns the header names listed in `Vary`.
    pub fn vary(&self) -> Vec<String> {
        split_vary(&self.headers.get_joined("vary").unwrap_or_default())
    }

    /// Returns `true` if the response includes a non-empty `Vary` header.
    pub fn has_vary(&self) -> bool {
        !self.vary().is_empty()
    }

    /// Turns this response into a `304 Not Modified` if the request's
    /// conditional headers match its validators.
    ///
    /// With `If-None-Match`, one of the listed tags (or `*`) must equal the
    /// `ETag`, and `If-Modified-Since`, when also sent, must equal
    /// `Last-Modified`. Without it, `If-Modified-Since` alone decides.
    pub fn is_not_modified(&mut self, request: &Request) -> bool {
        if !request.method().is_cacheable() {
            return false;
        }

        let if_modified_since = request.headers().get("if-modified-since");
        let etags = request.etags();
        let not_modified = if !etags.is_empty() {
            let tag_matches = etags
                .iter()
                .any(|tag| tag == "*" || Some(tag.as_str()) == self.etag());
            tag_matches && if_modified_since.is_none_or(|since| Some(since) == self.last_modified())
        } else if let Some(since) = if_modified_since {
            Some(since) == self.last_modified()
        } else {
            false
        };

        if not_modified {
            self.set_not_modified();
        }
        not_modified
    }

    /// Converts the response to a `304 Not Modified`: clears the body and
    /// drops headers a 304 must not carry.
    pub fn set_not_modified(&mut self) {
        self.status = StatusCode::NotModified;
        self.body.clear();
        for name in NOT_MODIFIED_STRIPPED {
            self.headers.remove(name);
        }
    }

    /// Adjusts the response to the request it answers.
    ///
    /// Bodiless statuses lose their body and entity headers. Answers to HEAD
    /// keep a `Content-Length` describing the body they no longer carry.
    pub fn prepare(&mut self, request: &Request) {
        let status = self.status;
        if status.is_informational()
            || status == StatusCode::NoContent
            || status == StatusCode::NotModified
        {
            self.body.clear();
            self.headers.remove("content-type");
            self.headers.remove("content-length");
        } else if *request.method() == Method::Head {
            if !self.headers.contains("content-length") && !self.headers.contains("transfer-encoding") {
                self.headers.set("Content-Length", self.body.len().to_string());
            }
            self.body.clear();
        }
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is non-empty and no
    ///   `Content-Type` header was set.
    /// - `Content-Length: <n>` (always written; an explicit header is kept only
    ///   for bodiless HEAD answers).
    /// - `Connection: keep-alive` or `Connection: close`.
    pub fn into_bytes(mut self) -> BytesMut {
        let content_length = match self.headers.get("content-length") {
            Some(declared) if self.body.is_empty() => declared.to_owned(),
            _ => self.body.len().to_string(),
        };
        self.headers.remove("content-length");

        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + self.body.len();
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        // Headers
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());

        // Header/body separator
        buf.put(&b"\r\n"[..]);

        // Body
        if !self.body.is_empty() {
            buf.put(self.body.as_slice());
        }

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

/// Splits a `Vary` value on commas and whitespace.
pub(crate) fn split_vary(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}
