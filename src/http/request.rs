//! HTTP/1.1 requests: wire parsing via [`httparse`] and programmatic
//! construction for forwarded and fragment sub-requests.

use std::collections::HashMap;
use std::net::IpAddr;

use bytes::Bytes;
use thiserror::Error;

use super::{CacheControl, Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// An HTTP/1.1 request.
///
/// Created either by [`Request::parse`] from a raw byte buffer, or by
/// [`Request::create`] from a URI. The body is stored as a [`Bytes`] buffer.
///
/// # Examples
///
/// ```
/// use rttp_cache::http::request::Request;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query_param("name"), Some("world"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// assert_eq!(request.uri(), "http://localhost/hello?name=world");
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    scheme: String,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    body: Bytes,
    params: HashMap<String, String>,
    remote_addr: Option<IpAddr>,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Host used when a request carries no `Host` header.
    pub const DEFAULT_HOST: &'static str = "localhost";

    /// Parse a raw HTTP/1.1 request from a byte slice.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body begins
    /// in `buf` (i.e. immediately after the `\r\n\r\n` header terminator).
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the request headers.
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: a required field (method, path, version) is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let Ok(method) = raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse::<Method>();

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let (path, query) = split_path(raw_path);
        let mut request = Self::from_parts(method, "http", path, query, header_map);
        request.version = version;
        request.body = Bytes::copy_from_slice(&buf[body_offset..]);

        Ok((request, body_offset))
    }

    /// Builds a request for `uri`.
    ///
    /// `uri` may be absolute (`https://example.com/a?b=c`) or origin-relative
    /// (`/a?b=c`). Relative URIs get the `http` scheme and no `Host` header,
    /// so [`host`](Self::host) falls back to [`DEFAULT_HOST`](Self::DEFAULT_HOST).
    ///
    /// # Examples
    ///
    /// ```
    /// use rttp_cache::http::{Method, Request};
    ///
    /// let req = Request::create("https://example.com:8443/feed?page=2", Method::Get);
    /// assert_eq!(req.scheme(), "https");
    /// assert_eq!(req.host(), "example.com:8443");
    /// assert_eq!(req.path(), "/feed");
    /// assert_eq!(req.uri(), "https://example.com:8443/feed?page=2");
    /// ```
    pub fn create(uri: &str, method: Method) -> Self {
        let (scheme, authority, rest) = split_uri(uri);
        let (path, query) = split_path(rest);
        let mut headers = Headers::new();
        if let Some(authority) = authority {
            headers.insert("Host", authority);
        }
        Self::from_parts(method, scheme.unwrap_or("http"), path, query, headers)
    }

    /// Builds a request for `uri` in the context of `base`.
    ///
    /// Relative URIs inherit the scheme and host of `base`. Cookies and the
    /// client address are carried over, which is what fragment sub-requests
    /// need to render as the same visitor.
    pub fn create_from(uri: &str, method: Method, base: &Request) -> Self {
        let mut request = Self::create(uri, method);
        if split_uri(uri).1.is_none() {
            request.scheme = base.scheme.clone();
            if let Some(host) = base.headers.get("host") {
                request.headers.set("Host", host);
            }
        }
        for cookie in base.headers.get_all("cookie") {
            request.headers.insert("Cookie", cookie);
        }
        request.remote_addr = base.remote_addr;
        request
    }

    fn from_parts(
        method: Method,
        scheme: &str,
        path: String,
        query: Option<String>,
        headers: Headers,
    ) -> Self {
        let params = query.as_deref().map(parse_query_string).unwrap_or_default();
        Self {
            method,
            scheme: scheme.to_owned(),
            path,
            version: 1,
            headers,
            query,
            body: Bytes::new(),
            params,
            remote_addr: None,
        }
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Replaces the HTTP method.
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Returns the URI scheme (`http` or `https`).
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Returns the `Host` header value, or [`DEFAULT_HOST`](Self::DEFAULT_HOST).
    pub fn host(&self) -> &str {
        self.headers.get("host").unwrap_or(Self::DEFAULT_HOST)
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the full URI: scheme, host, path and query string.
    pub fn uri(&self) -> String {
        let mut uri = format!("{}://{}{}", self.scheme, self.host(), self.path);
        if let Some(query) = self.query.as_deref().filter(|q| !q.is_empty()) {
            uri.push('?');
            uri.push_str(query);
        }
        uri
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request headers for modification.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns a parsed query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the address of the client that sent this request, if known.
    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    /// Records the address of the client that sent this request.
    pub fn set_remote_addr(&mut self, addr: IpAddr) {
        self.remote_addr = Some(addr);
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1, // HTTP/1.1 default: keep-alive
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.parse().ok()
    }

    /// Returns the parsed `Cache-Control` request directives.
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers.get_joined("cache-control").unwrap_or_default())
    }

    /// Returns `true` if the client asked caches not to serve a stored
    /// response (`Cache-Control: no-cache` or `Pragma: no-cache`).
    pub fn is_no_cache(&self) -> bool {
        self.cache_control().has("no-cache")
            || self
                .headers
                .get("pragma")
                .is_some_and(|p| p.trim().eq_ignore_ascii_case("no-cache"))
    }

    /// Returns the entity tags listed in `If-None-Match`, in order.
    pub fn etags(&self) -> Vec<String> {
        self.headers
            .get_all("if-none-match")
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Returns the cookies sent with the request as `(name, value)` pairs.
    pub fn cookies(&self) -> Vec<(String, String)> {
        self.headers
            .get_all("cookie")
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                (!name.is_empty()).then(|| (name.to_owned(), value.trim().to_owned()))
            })
            .collect()
    }
}

/// Splits `scheme://authority/rest` into its parts. Relative input yields
/// `(None, None, input)`.
fn split_uri(uri: &str) -> (Option<&str>, Option<&str>, &str) {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return (None, None, uri);
    };
    let end = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, rest) = rest.split_at(end);
    (Some(scheme), Some(authority).filter(|a| !a.is_empty()), rest)
}

fn split_path(raw_path: &str) -> (String, Option<String>) {
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, Some(query.to_owned())),
        None => (raw_path, None),
    };
    let path = if path.is_empty() { "/" } else { path };
    (path.to_owned(), query)
}

/// Parses a URL query string (`key=value&key2=value2`) into a `HashMap`.
///
/// Keys and values have `+` decoded as a space. Percent-decoding is not
/// performed.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.replace('+', " ");
            let value = parts.next().unwrap_or("").replace('+', " ");
            Some((key, value))
        })
        .collect()
}
