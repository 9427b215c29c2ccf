//! The gateway cache.
//!
//! [`HttpCache`] wraps an origin [`Kernel`] and answers requests from a
//! [`Store`] whenever HTTP caching rules allow it.
//!
//! ## Request flow
//!
//! ```text
//! unsafe method ─────────────▶ invalidate: forward, then expire stored entries
//! Expect / not cacheable ────▶ pass:       forward untouched
//! no-cache + allow_reload ───▶ fetch
//! otherwise ─────────────────▶ lookup
//!                                 ├─ miss ───────────▶ fetch ──▶ store if cacheable
//!                                 ├─ stale ──────────▶ validate (conditional GET)
//!                                 └─ fresh ──────────▶ cached entry
//! ```
//!
//! A stale entry first takes the per-key revalidation lock. When someone
//! else holds it, the entry is served stale inside its
//! `stale-while-revalidate` window, or the cache waits briefly for the
//! other party to finish.
//!
//! Every decision is recorded in a [`Trace`], available through
//! [`HttpCache::log`] and, in debug mode, in a response header.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::kernel::{Kernel, KernelError, RequestType};
use crate::store::{LockOutcome, Store, StoreError};
use crate::surrogate::{BODY_EVAL_HEADER, Surrogate, SurrogateError, Template};
use crate::{BoxFuture, Method, Request, Response, StatusCode};

pub mod options;
pub mod strategy;
pub mod trace;

pub use options::{CacheOptions, LockWaitOptions};
pub use strategy::ResponseCacheStrategy;
pub use trace::{CacheEvent, Trace, trace_key};


/// Origin statuses a stale entry may stand in for.
const STALE_IF_ERROR_STATUSES: [StatusCode; 4] = [
    StatusCode::InternalServerError,
    StatusCode::BadGateway,
    StatusCode::ServiceUnavailable,
    StatusCode::GatewayTimeout,
];

/// Errors surfaced by [`HttpCache::handle`].
///
/// Store errors only reach the caller in debug mode; otherwise they are
/// traced and the request falls back to the origin.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Surrogate(#[from] SurrogateError),

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// State belonging to one main request and the fragments it embeds.
#[derive(Default)]
struct Scope {
    trace: Mutex<Trace>,
    strategy: Mutex<ResponseCacheStrategy>,
    /// Requests whose revalidation lock this scope took and still holds.
    locks: Mutex<Vec<Request>>,
}

impl Scope {
    fn record(&self, request: &Request, event: CacheEvent) {
        let key = trace_key(request);
        debug!(request = %key, %event, "cache");
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(key, event);
    }

    fn log(&self) -> String {
        self.trace.lock().unwrap_or_else(PoisonError::into_inner).log()
    }

    fn take_trace(&self) -> Trace {
        std::mem::take(&mut *self.trace.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn hold_lock(&self, request: &Request) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
    }

    /// Forgets the lock taken for `request`'s URI. Returns `false` when this
    /// scope never held it.
    fn forget_lock(&self, request: &Request) -> bool {
        let uri = request.uri();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        match locks.iter().position(|held| held.uri() == uri) {
            Some(index) => {
                locks.swap_remove(index);
                true
            }
            None => false,
        }
    }

    fn take_locks(&self) -> Vec<Request> {
        std::mem::take(&mut *self.locks.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// An RFC 9111 gateway cache in front of an origin kernel.
///
/// `HttpCache` is itself a [`Kernel`], so it can be handed to the
/// [`Server`](crate::server::Server) or wrapped by another cache.
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_cache::kernel::{KernelError, kernel_fn};
/// use rttp_cache::{CacheOptions, Esi, FileStore, HttpCache, Method, Request, RequestType, Response, StatusCode};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let origin = kernel_fn(|_req: Request| async {
///     Ok::<_, KernelError>(
///         Response::new(StatusCode::Ok)
///             .header("Cache-Control", "public, max-age=60")
///             .body("hello"),
///     )
/// });
/// let cache = HttpCache::new(origin, FileStore::new("/tmp/cache")?, CacheOptions::default())
///     .with_surrogate(Esi);
///
/// let response = cache
///     .handle(Request::create("/", Method::Get), RequestType::Main, true)
///     .await?;
/// assert_eq!(response.content(), b"hello");
/// assert_eq!(cache.log(), "GET /: miss, store");
/// # Ok(())
/// # }
/// ```
pub struct HttpCache<K, S> {
    kernel: K,
    store: S,
    surrogate: Option<Box<dyn Surrogate>>,
    options: CacheOptions,
    clock: Arc<dyn Clock>,
    last_trace: Mutex<Trace>,
}

impl<K: Kernel, S: Store> HttpCache<K, S> {
    /// Wraps `kernel`, persisting responses in `store`.
    pub fn new(kernel: K, store: S, options: CacheOptions) -> Self {
        Self {
            kernel,
            store,
            surrogate: None,
            options,
            clock: Arc::new(SystemClock),
            last_trace: Mutex::new(Trace::default()),
        }
    }

    /// Enables page assembly with the given dialect.
    #[must_use]
    pub fn with_surrogate(mut self, surrogate: impl Surrogate + 'static) -> Self {
        self.surrogate = Some(Box::new(surrogate));
        self
    }

    /// Replaces the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn surrogate(&self) -> Option<&dyn Surrogate> {
        self.surrogate.as_deref()
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Returns the trace of the last completed main request.
    pub fn traces(&self) -> Trace {
        self.last_trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the last main request's trace as a single line.
    pub fn log(&self) -> String {
        self.traces().log()
    }

    /// Answers `request`, from the store when possible.
    ///
    /// Each main request starts a fresh trace; fragment sub-requests issued
    /// while assembling it are recorded in the same trace. Revalidation
    /// locks taken along the way are released before returning, whatever
    /// the outcome.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Kernel`]: the origin failed and `catch` was not set.
    /// - [`CacheError::Surrogate`]: include markup was malformed or a
    ///   mandatory fragment failed.
    /// - [`CacheError::Store`]: only in debug mode.
    pub async fn handle(
        &self,
        request: Request,
        kind: RequestType,
        catch: bool,
    ) -> Result<Response, CacheError> {
        let scope = Scope::default();
        let result = self.handle_in_scope(&scope, request, kind, catch).await;
        self.release_locks(&scope).await;
        if kind == RequestType::Main {
            *self.last_trace.lock().unwrap_or_else(PoisonError::into_inner) = scope.take_trace();
        }
        result
    }

    async fn handle_in_scope(
        &self,
        scope: &Scope,
        request: Request,
        kind: RequestType,
        catch: bool,
    ) -> Result<Response, CacheError> {
        let original = request.clone();
        let mut response = self.dispatch(scope, request, catch).await?;
        self.restore_body(scope, &original, &mut response).await?;

        if kind == RequestType::Main && self.options.debug {
            let log = scope.log();
            response.headers_mut().set(self.options.trace_header.as_str(), log);
        }

        if self.surrogate.is_some() {
            let now = self.clock.now();
            let mut strategy = scope.strategy.lock().unwrap_or_else(PoisonError::into_inner);
            match kind {
                RequestType::Main => strategy.update(&mut response, now),
                RequestType::Sub => strategy.add(&response, now),
            }
        }

        response.prepare(&original);
        response.is_not_modified(&original);
        Ok(response)
    }

    async fn dispatch(
        &self,
        scope: &Scope,
        request: Request,
        catch: bool,
    ) -> Result<Response, CacheError> {
        if !request.method().is_safe() {
            self.invalidate(scope, request, catch).await
        } else if request.headers().contains("expect") || !request.method().is_cacheable() {
            self.pass(scope, request, catch).await
        } else if self.options.allow_reload && request.is_no_cache() {
            scope.record(&request, CacheEvent::Reload);
            self.fetch(scope, request, catch).await
        } else {
            self.lookup(scope, request, catch).await
        }
    }

    /// Evaluates an assembled body: resolves every include of the stored
    /// template through this cache.
    async fn restore_body(
        &self,
        scope: &Scope,
        request: &Request,
        response: &mut Response,
    ) -> Result<(), CacheError> {
        if !response.headers_mut().remove(BODY_EVAL_HEADER) {
            return Ok(());
        }
        if *request.method() == Method::Head {
            response.set_content(Vec::new());
            response.headers_mut().remove("content-length");
            return Ok(());
        }

        let template = Template::from_body(response.content())?;
        let renderer = ScopedCache { cache: self, scope };
        let body = template.render(&renderer, request).await?;
        response.set_content(body);
        if !response.headers().contains("transfer-encoding") {
            let length = response.content().len().to_string();
            response.headers_mut().set("Content-Length", length);
        }
        Ok(())
    }

    // ── Dispatch branches ──────────────────────────────────────────────────

    async fn pass(
        &self,
        scope: &Scope,
        request: Request,
        catch: bool,
    ) -> Result<Response, CacheError> {
        scope.record(&request, CacheEvent::Pass);
        self.forward(scope, request, catch, None).await
    }

    /// Forwards an unsafe request, then expires what is stored for its URI
    /// and for any `Location`/`Content-Location` it answered with.
    async fn invalidate(
        &self,
        scope: &Scope,
        request: Request,
        catch: bool,
    ) -> Result<Response, CacheError> {
        let response = self.pass(scope, request.clone(), catch).await?;
        let status = response.status();
        if !(status.is_success() || status.is_redirection()) {
            return Ok(response);
        }

        match self.expire_related(&request, &response).await {
            Ok(()) => scope.record(&request, CacheEvent::Invalidate),
            Err(e) => {
                scope.record(&request, CacheEvent::InvalidateFailed);
                warn!(error = %e, uri = %request.uri(), "cache invalidation failed");
                if self.options.debug {
                    return Err(e.into());
                }
            }
        }
        Ok(response)
    }

    async fn expire_related(&self, request: &Request, response: &Response) -> Result<(), StoreError> {
        self.store.invalidate(request).await?;
        for header in ["Location", "Content-Location"] {
            if let Some(uri) = response.headers().get(header) {
                let target = Request::create_from(uri, Method::Get, request);
                self.store.invalidate(&target).await?;
            }
        }
        Ok(())
    }

    /// Serves from the store when possible.
    fn lookup<'a>(
        &'a self,
        scope: &'a Scope,
        request: Request,
        catch: bool,
    ) -> BoxFuture<'a, Result<Response, CacheError>> {
        Box::pin(async move {
            let entry = match self.store.lookup(&request).await {
                Ok(entry) => entry,
                Err(e) => {
                    scope.record(&request, CacheEvent::LookupFailed);
                    warn!(error = %e, uri = %request.uri(), "cache lookup failed");
                    if self.options.debug {
                        return Err(e.into());
                    }
                    return self.pass(scope, request, catch).await;
                }
            };

            let Some(mut entry) = entry else {
                scope.record(&request, CacheEvent::Miss);
                return self.fetch(scope, request, catch).await;
            };

            if !self.is_fresh_enough(scope, &request, &mut entry).await? {
                scope.record(&request, CacheEvent::Stale);
                return self.validate(scope, request, entry, catch).await;
            }

            if entry.cache_control().has("no-cache") {
                return self.validate(scope, request, entry, catch).await;
            }

            scope.record(&request, CacheEvent::Fresh);
            let age = entry.age(self.clock.now());
            entry.headers_mut().set("Age", age.to_string());
            Ok(entry)
        })
    }

    async fn is_fresh_enough(
        &self,
        scope: &Scope,
        request: &Request,
        entry: &mut Response,
    ) -> Result<bool, CacheError> {
        let now = self.clock.now();
        if !entry.is_fresh(now) {
            return self.lock(scope, request, entry).await;
        }

        if self.options.allow_revalidate {
            if let Some(max_age) = request.cache_control().seconds("max-age") {
                return Ok(max_age > 0 && max_age >= entry.age(now));
            }
        }
        Ok(true)
    }

    /// Coordinates revalidation of a stale entry.
    ///
    /// Returns `false` when this request should revalidate. Returns `true`
    /// when `entry` is to be served as is: stale, replaced by what another
    /// party stored, or turned into a 503.
    async fn lock(
        &self,
        scope: &Scope,
        request: &Request,
        entry: &mut Response,
    ) -> Result<bool, CacheError> {
        let held_by = match self.store.lock(request).await {
            Ok(LockOutcome::Acquired) => {
                scope.hold_lock(request);
                return Ok(false);
            }
            Ok(LockOutcome::HeldBy(path)) => path,
            Err(e) => {
                warn!(error = %e, uri = %request.uri(), "cache lock failed");
                if self.options.debug {
                    return Err(e.into());
                }
                return Ok(false);
            }
        };

        if self.may_serve_stale_while_revalidate(entry) {
            scope.record(request, CacheEvent::StaleWhileRevalidate);
            return Ok(true);
        }

        debug!(lock = %held_by.display(), "waiting for revalidation by another party");
        let released = match self.wait_for_lock(request).await {
            Ok(released) => released,
            Err(e) => {
                warn!(error = %e, uri = %request.uri(), "cache lock poll failed");
                if self.options.debug {
                    return Err(e.into());
                }
                return Ok(false);
            }
        };

        if released {
            *entry = self.lookup(scope, request.clone(), false).await?;
        } else {
            entry.set_status(StatusCode::ServiceUnavailable);
            entry.set_content("503 Service Unavailable");
            entry.headers_mut().set("Retry-After", "10");
        }
        Ok(true)
    }

    fn may_serve_stale_while_revalidate(&self, entry: &Response) -> bool {
        let window = entry
            .cache_control()
            .seconds("stale-while-revalidate")
            .unwrap_or(self.options.stale_while_revalidate);
        entry.ttl(self.clock.now()).unwrap_or(0).abs() < window
    }

    /// Polls until the lock is gone. `Ok(true)` means it went away quickly
    /// enough to reuse the other party's result.
    async fn wait_for_lock(&self, request: &Request) -> Result<bool, StoreError> {
        let wait = self.options.lock_wait;
        let tick = Duration::from_millis(wait.tick_ms.max(1));
        let longest = tick * 8;
        let timeout = Duration::from_millis(wait.timeout_ms);
        let threshold = Duration::from_millis(wait.release_threshold_ms);

        let start = Instant::now();
        let mut delay = tick;
        while self.store.is_locked(request).await? {
            let waited = start.elapsed();
            if waited >= timeout {
                return Ok(false);
            }
            tokio::time::sleep(delay.min(timeout - waited)).await;
            delay = (delay * 2).min(longest);
        }
        Ok(start.elapsed() <= threshold)
    }

    /// Revalidates a stale entry with a conditional request.
    async fn validate(
        &self,
        scope: &Scope,
        request: Request,
        entry: Response,
        catch: bool,
    ) -> Result<Response, CacheError> {
        let mut sub_request = request.clone();
        if *request.method() == Method::Head {
            sub_request.set_method(Method::Get);
        }
        if let Some(last_modified) = entry.last_modified() {
            sub_request
                .headers_mut()
                .set("If-Modified-Since", last_modified);
        }

        let cached_etags: Vec<String> = entry.etag().map(str::to_owned).into_iter().collect();
        let request_etags = request.etags();
        let mut etags = cached_etags.clone();
        for tag in &request_etags {
            if !etags.contains(tag) {
                etags.push(tag.clone());
            }
        }
        if !etags.is_empty() {
            sub_request
                .headers_mut()
                .set("If-None-Match", etags.join(", "));
        }

        let mut response = self.forward(scope, sub_request, catch, Some(&entry)).await?;

        if response.status() == StatusCode::NotModified {
            scope.record(&request, CacheEvent::Valid);

            // The client holds a representation we do not; the 304 is theirs.
            let etag = response.etag().map(str::to_owned);
            if let Some(etag) = etag {
                if request_etags.contains(&etag) && !cached_etags.contains(&etag) {
                    return Ok(response);
                }
            }

            let mut refreshed = entry;
            refreshed.headers_mut().remove("date");
            for name in ["Date", "Expires", "Cache-Control", "ETag", "Last-Modified"] {
                if let Some(value) = response.headers().get(name) {
                    refreshed.headers_mut().set(name, value);
                }
            }
            response = refreshed;
        } else {
            scope.record(&request, CacheEvent::Invalid);
        }

        if response.is_cacheable(self.clock.now()) {
            self.store_response(scope, &request, &mut response).await?;
        }
        Ok(response)
    }

    /// Fetches a full response from the origin.
    async fn fetch(
        &self,
        scope: &Scope,
        request: Request,
        catch: bool,
    ) -> Result<Response, CacheError> {
        let mut sub_request = request.clone();
        if *request.method() == Method::Head {
            sub_request.set_method(Method::Get);
        }
        sub_request.headers_mut().remove("if-modified-since");
        sub_request.headers_mut().remove("if-none-match");

        let mut response = self.forward(scope, sub_request, catch, None).await?;
        if response.is_cacheable(self.clock.now()) {
            self.store_response(scope, &request, &mut response).await?;
        }
        Ok(response)
    }

    /// Sends a request to the origin and normalizes the answer.
    ///
    /// With an `entry` at hand, a 5xx answer is replaced by the entry while
    /// it is within its `stale-if-error` grace period.
    async fn forward(
        &self,
        scope: &Scope,
        mut request: Request,
        catch: bool,
        entry: Option<&Response>,
    ) -> Result<Response, CacheError> {
        if let Some(surrogate) = &self.surrogate {
            surrogate.add_surrogate_capability(&mut request);
        }

        let original = request.clone();
        if let Some(client) = request.remote_addr() {
            let forwarded = match request.headers().get_joined("x-forwarded-for") {
                Some(chain) => format!("{chain}, {client}"),
                None => client.to_string(),
            };
            request.headers_mut().set("X-Forwarded-For", forwarded);
        }
        request.set_remote_addr(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let mut response = self
            .kernel
            .handle(request, RequestType::Main, catch)
            .await?;
        let now = self.clock.now();

        if let Some(entry) = entry {
            if STALE_IF_ERROR_STATUSES.contains(&response.status()) {
                let grace = entry
                    .cache_control()
                    .seconds("stale-if-error")
                    .unwrap_or(self.options.stale_if_error);
                if entry.age(now) <= entry.max_age().unwrap_or(0) + grace {
                    scope.record(&original, CacheEvent::StaleIfError);
                    return Ok(entry.clone());
                }
            }
        }

        if !response.headers().contains("date") {
            response.set_date(now);
        }

        if let Some(surrogate) = &self.surrogate {
            if surrogate.needs_parsing(&response) {
                surrogate.process(&mut response)?;
            }
        }

        if self.is_private_request(&original) && !response.cache_control().has("public") {
            response.set_private();
        } else if self.options.default_ttl > 0
            && response.ttl(now).is_none()
            && !response.cache_control().has("must-revalidate")
        {
            response.set_ttl(self.options.default_ttl, now);
        }

        Ok(response)
    }

    fn is_private_request(&self, request: &Request) -> bool {
        self.options.private_headers.iter().any(|name| {
            if name.eq_ignore_ascii_case("cookie") {
                !request.cookies().is_empty()
            } else {
                request.headers().contains(name)
            }
        })
    }

    /// Writes the response to the store and releases the revalidation lock
    /// if this request holds it.
    async fn store_response(
        &self,
        scope: &Scope,
        request: &Request,
        response: &mut Response,
    ) -> Result<(), CacheError> {
        let written = self.store.write(request, response).await;
        let outcome = match written {
            Ok(_) => {
                scope.record(request, CacheEvent::Store);
                let age = response.age(self.clock.now());
                response.headers_mut().set("Age", age.to_string());
                Ok(())
            }
            Err(e) => {
                scope.record(request, CacheEvent::StoreFailed);
                warn!(error = %e, uri = %request.uri(), "cache store failed");
                if self.options.debug { Err(e.into()) } else { Ok(()) }
            }
        };

        if scope.forget_lock(request) {
            self.unlock(request).await;
        }
        outcome
    }

    /// Releases every lock `scope` still holds: the response was served
    /// stale, was not cacheable, or the origin failed.
    async fn release_locks(&self, scope: &Scope) {
        for request in scope.take_locks() {
            debug!(uri = %request.uri(), "releasing revalidation lock");
            self.unlock(&request).await;
        }
    }

    async fn unlock(&self, request: &Request) {
        if let Err(e) = self.store.unlock(request).await {
            warn!(error = %e, uri = %request.uri(), "cache unlock failed");
        }
    }
}

/// Resolves fragment sub-requests inside the scope of the page that
/// embeds them.
struct ScopedCache<'a, K, S> {
    cache: &'a HttpCache<K, S>,
    scope: &'a Scope,
}

impl<K: Kernel, S: Store> Kernel for ScopedCache<'_, K, S> {
    fn handle(
        &self,
        request: Request,
        kind: RequestType,
        catch: bool,
    ) -> BoxFuture<'_, Result<Response, KernelError>> {
        Box::pin(async move {
            self.cache
                .handle_in_scope(self.scope, request, kind, catch)
                .await
                .map_err(KernelError::new)
        })
    }
}

impl<K: Kernel, S: Store> Kernel for HttpCache<K, S> {
    fn handle(
        &self,
        request: Request,
        kind: RequestType,
        catch: bool,
    ) -> BoxFuture<'_, Result<Response, KernelError>> {
        Box::pin(async move {
            HttpCache::handle(self, request, kind, catch)
                .await
                .map_err(KernelError::new)
        })
    }
}
