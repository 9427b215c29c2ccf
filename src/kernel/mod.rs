//! The application kernel contract the cache wraps.
//!
//! A [`Kernel`] turns a [`Request`] into a [`Response`]. The origin
//! application implements it, and so does [`HttpCache`](crate::cache::HttpCache),
//! which lets caches be served by the [`Server`](crate::server::Server) or
//! stacked on top of each other.
//!
//! ## Core types
//!
//! - [`Kernel`]: trait implemented by anything that can answer requests.
//! - [`RequestType`]: whether a request is a top-level request or a fragment
//!   sub-request.
//! - [`KernelError`]: error raised by an origin application.
//! - [`kernel_fn`]: adapts an async closure into a [`Kernel`].
//! - [`Logged`]: decorator that logs each request's method, path, status and
//!   duration.

use std::error::Error;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::{BoxFuture, Request, Response, StatusCode};

/// Distinguishes top-level requests from fragment sub-requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    /// A request received from a client.
    Main,
    /// A request issued while assembling another response (ESI/SSI include).
    Sub,
}

/// An error raised by an origin application.
///
/// The cache never inspects these; they propagate to the caller untouched.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct KernelError {
    #[source]
    source: Box<dyn Error + Send + Sync>,
}

impl KernelError {
    /// Wraps any error or message.
    pub fn new(source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

/// Anything that can answer HTTP requests.
///
/// # Contract
///
/// - `catch` asks the kernel to convert its own failures into error
///   responses instead of returning `Err`.
/// - Implementations **must** be `Send + Sync`; a kernel is shared across
///   Tokio tasks.
pub trait Kernel: Send + Sync {
    /// Handles one request.
    fn handle(
        &self,
        request: Request,
        kind: RequestType,
        catch: bool,
    ) -> BoxFuture<'_, Result<Response, KernelError>>;
}

impl<K: Kernel + ?Sized> Kernel for Arc<K> {
    fn handle(
        &self,
        request: Request,
        kind: RequestType,
        catch: bool,
    ) -> BoxFuture<'_, Result<Response, KernelError>> {
        (**self).handle(request, kind, catch)
    }
}

/// A [`Kernel`] backed by an async closure. Built by [`kernel_fn`].
pub struct KernelFn<F> {
    handler: F,
}

/// Adapts an async closure into a [`Kernel`].
///
/// When `catch` is set, an `Err` from the closure is logged and replaced by
/// a `500 Internal Server Error` response.
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_cache::kernel::{KernelError, kernel_fn};
/// use rttp_cache::{Request, Response, StatusCode};
///
/// let origin = kernel_fn(|_req: Request| async {
///     Ok::<_, KernelError>(
///         Response::new(StatusCode::Ok)
///             .header("Cache-Control", "public, max-age=60")
///             .body("Hello!"),
///     )
/// });
/// ```
pub fn kernel_fn<F, Fut>(handler: F) -> KernelFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, KernelError>> + Send + 'static,
{
    KernelFn { handler }
}

impl<F, Fut> Kernel for KernelFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, KernelError>> + Send + 'static,
{
    fn handle(
        &self,
        request: Request,
        _kind: RequestType,
        catch: bool,
    ) -> BoxFuture<'_, Result<Response, KernelError>> {
        let method = request.method().clone();
        let path = request.path().to_owned();
        let pending = (self.handler)(request);
        Box::pin(async move {
            match pending.await {
                Err(e) if catch => {
                    error!(%method, %path, error = %e, "handler failed, sending 500");
                    Ok(Response::new(StatusCode::InternalServerError).body("Internal Server Error"))
                }
                result => result,
            }
        })
    }
}

/// Kernel decorator that logs each request's method, path, status, and duration.
///
/// Emits a single `tracing::info!` line after the inner kernel completes,
/// in the format:
///
/// ```text
/// METHOD /path - STATUS (duration)
/// ```
pub struct Logged<K> {
    inner: K,
}

impl<K: Kernel> Logged<K> {
    /// Wraps `inner`.
    pub fn new(inner: K) -> Self {
        Self { inner }
    }

    /// Returns the wrapped kernel.
    pub fn inner(&self) -> &K {
        &self.inner
    }
}

impl<K: Kernel> Kernel for Logged<K> {
    fn handle(
        &self,
        request: Request,
        kind: RequestType,
        catch: bool,
    ) -> BoxFuture<'_, Result<Response, KernelError>> {
        Box::pin(async move {
            let start = Instant::now();
            let method = request.method().as_str().to_string();
            let path = request.path().to_string();

            let result = self.inner.handle(request, kind, catch).await;

            let duration = start.elapsed();
            match &result {
                Ok(response) => {
                    info!("{} {} - {} ({:?})", method, path, response.status().as_u16(), duration)
                }
                Err(e) => warn!("{} {} - failed: {} ({:?})", method, path, e, duration),
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;

    fn failing() -> impl Kernel {
        kernel_fn(|_req: Request| async { Err::<Response, _>(KernelError::new("database unreachable")) })
    }

    #[tokio::test]
    async fn catch_turns_errors_into_500() {
        let response = failing()
            .handle(Request::create("/", Method::Get), RequestType::Main, true)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn errors_propagate_without_catch() {
        let err = failing()
            .handle(Request::create("/", Method::Get), RequestType::Main, false)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "database unreachable");
    }

    #[tokio::test]
    async fn logged_passes_responses_through() {
        let kernel = Logged::new(kernel_fn(|req: Request| async move {
            Ok::<_, KernelError>(Response::new(StatusCode::Ok).body(req.path().to_owned()))
        }));
        let response = kernel
            .handle(Request::create("/echo", Method::Get), RequestType::Sub, false)
            .await
            .unwrap();
        assert_eq!(response.content(), b"/echo");
    }

    #[tokio::test]
    async fn arc_kernels_delegate() {
        let kernel: Arc<dyn Kernel> = Arc::new(failing());
        let response = kernel
            .handle(Request::create("/", Method::Get), RequestType::Main, true)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::InternalServerError);
    }
}
