//! Response storage for the gateway cache.
//!
//! A [`Store`] persists responses keyed by request URI, negotiates `Vary`
//! variants on lookup, and hands out per-key revalidation locks.
//! [`FileStore`] is the on-disk implementation.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::{BoxFuture, Request, Response};

pub mod file;

pub use file::FileStore;

/// Errors produced by a [`Store`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unreadable cache metadata at {}: {source}", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt cache entry at {}: {reason}", path.display())]
    CorruptEntry { path: PathBuf, reason: String },

    #[error("short write at {}: expected {expected} bytes, found {written}", path.display())]
    ShortWrite {
        path: PathBuf,
        expected: u64,
        written: u64,
    },
}

/// Result of trying to take the revalidation lock for a cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller now holds the lock.
    Acquired,
    /// The lock is already held, by another store or by an earlier caller
    /// of this one; the path names the lock marker.
    HeldBy(PathBuf),
}

impl LockOutcome {
    /// `true` for [`LockOutcome::Acquired`].
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired)
    }
}

/// Persistent storage for cached responses.
///
/// # Contract
///
/// - `lookup` returns the first stored variant whose `Vary` headers match the
///   request, with its body loaded, or `None`. A variant whose body is gone
///   is a miss.
/// - `write` stores the response (adding `X-Content-Digest`) and returns the
///   cache key. It supersedes the variant matching the same `Vary` context
///   and never persists `Age`.
/// - `invalidate` marks every fresh variant for the request's URI as stale.
/// - `lock` / `unlock` / `is_locked` coordinate revalidation across
///   processes and across tasks sharing one store. A held lock is never
///   granted twice. `unlock` only releases locks this store took.
/// - `purge` deletes everything stored for a URL and reports whether
///   anything was there.
/// - `cleanup` releases every lock this store holds.
pub trait Store: Send + Sync {
    /// Finds the stored response matching `request`.
    fn lookup<'a>(&'a self, request: &'a Request)
    -> BoxFuture<'a, Result<Option<Response>, StoreError>>;

    /// Stores `response` as the answer to `request`. Returns the cache key.
    fn write<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut Response,
    ) -> BoxFuture<'a, Result<String, StoreError>>;

    /// Expires all fresh variants stored for the request's URI.
    fn invalidate<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Tries to take the revalidation lock for the request's cache key.
    fn lock<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<LockOutcome, StoreError>>;

    /// Releases a lock this store holds. Returns `false` when it held none,
    /// leaving locks taken elsewhere in place.
    fn unlock<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Returns `true` while anyone, this store included, holds the lock.
    fn is_locked<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Deletes the stored entries for `url`.
    fn purge<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Releases every lock held by this store.
    fn cleanup(&self) -> BoxFuture<'_, Result<(), StoreError>>;
}

impl<S: Store + ?Sized> Store for Arc<S> {
    fn lookup<'a>(
        &'a self,
        request: &'a Request,
    ) -> BoxFuture<'a, Result<Option<Response>, StoreError>> {
        (**self).lookup(request)
    }

    fn write<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut Response,
    ) -> BoxFuture<'a, Result<String, StoreError>> {
        (**self).write(request, response)
    }

    fn invalidate<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<(), StoreError>> {
        (**self).invalidate(request)
    }

    fn lock<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<LockOutcome, StoreError>> {
        (**self).lock(request)
    }

    fn unlock<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<bool, StoreError>> {
        (**self).unlock(request)
    }

    fn is_locked<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<bool, StoreError>> {
        (**self).is_locked(request)
    }

    fn purge<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
        (**self).purge(url)
    }

    fn cleanup(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        (**self).cleanup()
    }
}
