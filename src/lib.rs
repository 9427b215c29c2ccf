//! # rttp-cache
//!
//! An async HTTP gateway cache written in Rust. [`HttpCache`] sits in front
//! of an origin application (any [`Kernel`]) and answers from a disk
//! [`Store`] whenever HTTP caching rules allow, revalidating, serving stale
//! content and assembling ESI/SSI pages along the way.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rttp_cache::kernel::{KernelError, kernel_fn};
//! use rttp_cache::{CacheOptions, FileStore, HttpCache, Request, Response, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let origin = kernel_fn(|_req: Request| async {
//!         Ok::<_, KernelError>(
//!             Response::new(StatusCode::Ok)
//!                 .header("Cache-Control", "public, s-maxage=60")
//!                 .body("Hello, World!"),
//!         )
//!     });
//!     let store = FileStore::new("/tmp/rttp-cache")?;
//!     let cache = HttpCache::new(origin, store, CacheOptions::default());
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.run(Arc::new(cache)).await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod cache;
pub mod clock;
pub mod http;
pub mod kernel;
pub mod server;
pub mod store;
pub mod surrogate;

/// A boxed, `Send` future. The return type of every async trait method in
/// this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheError, CacheEvent, CacheOptions, HttpCache};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use kernel::{Kernel, KernelError, RequestType};
pub use server::{Server, ServerError};
pub use store::{FileStore, LockOutcome, Store, StoreError};
pub use surrogate::{Esi, Ssi, Surrogate};
