//! Filesystem-backed [`Store`].
//!
//! Layout under the root directory:
//!
//! - `md<sha256(uri)>`: JSON metadata, a list of `(request headers, response
//!   headers)` pairs ordered newest first. The status code travels as an
//!   `X-Status` header.
//! - `en<sha256(body)>`: the response body, shared by every entry with the
//!   same content.
//! - `md<...>.lck`: revalidation lock marker, created exclusively.
//!
//! Every key is sharded as `ab/cd/ef/rest` to keep directories small.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{LockOutcome, Store, StoreError};
use crate::clock::{Clock, SystemClock};
use crate::http::response::split_vary;
use crate::{BoxFuture, Headers, Method, Request, Response, StatusCode};

const STATUS_HEADER: &str = "X-Status";
const DIGEST_HEADER: &str = "X-Content-Digest";
const LOCK_SUFFIX: &str = ".lck";

/// Distinguishes temp files written concurrently by the same process.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One stored variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    request: Headers,
    response: Headers,
}

impl StoredEntry {
    fn vary(&self) -> String {
        self.response.get_joined("vary").unwrap_or_default()
    }
}

/// A [`Store`] that keeps entries as files below a root directory.
///
/// Locks are plain marker files, so several processes sharing the root
/// coordinate revalidation through the filesystem. Locks still held when
/// the store is dropped are released.
///
/// # Examples
///
/// ```no_run
/// use rttp_cache::store::FileStore;
///
/// let store = FileStore::new("/var/cache/rttp").expect("cache dir");
/// assert!(store.root().ends_with("rttp"));
/// ```
pub struct FileStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, PathBuf>>,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            clock: Arc::new(SystemClock),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Replaces the time source used when expiring entries.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the metadata key for a request: `md` followed by the SHA-256
    /// of its full URI.
    pub fn cache_key(&self, request: &Request) -> String {
        key_for_uri(&request.uri())
    }

    /// Maps a key to its sharded location.
    pub fn path(&self, key: &str) -> PathBuf {
        match (key.get(0..2), key.get(2..4), key.get(4..6), key.get(6..)) {
            (Some(a), Some(b), Some(c), Some(rest)) if !rest.is_empty() => {
                self.root.join(a).join(b).join(c).join(rest)
            }
            _ => self.root.join(key),
        }
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let mut path = self.path(key).into_os_string();
        path.push(LOCK_SUFFIX);
        PathBuf::from(path)
    }

    fn held_locks(&self) -> std::sync::MutexGuard<'_, HashMap<String, PathBuf>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Files ──────────────────────────────────────────────────────────────

    async fn load_entries(&self, key: &str) -> Result<Vec<StoredEntry>, StoreError> {
        let path = self.path(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_slice(&data).map_err(|source| StoreError::Metadata { path, source })
    }

    /// Writes `data` under `key` atomically: temp file, size check, rename.
    async fn save(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.path(key);
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(io_error(&dir))?;

        let tmp = dir.join(format!(
            ".{}.{}.{}.tmp",
            key,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&tmp, data).await.map_err(io_error(&tmp))?;
        let written = tokio::fs::metadata(&tmp)
            .await
            .map_err(io_error(&tmp))?
            .len();
        if written != data.len() as u64 {
            Self::discard(&tmp).await;
            return Err(StoreError::ShortWrite {
                path,
                expected: data.len() as u64,
                written,
            });
        }
        tokio::fs::rename(&tmp, &path).await.map_err(io_error(&path))
    }

    /// Deletes an abandoned temp file; failures are only logged.
    async fn discard(tmp: &Path) {
        if let Err(e) = tokio::fs::remove_file(tmp).await {
            warn!(path = %tmp.display(), error = %e, "failed to remove temp file");
        }
    }

    async fn save_entries(&self, key: &str, entries: &[StoredEntry]) -> Result<(), StoreError> {
        let data = serde_json::to_vec(entries).map_err(|source| StoreError::Metadata {
            path: self.path(key),
            source,
        })?;
        self.save(key, &data).await
    }

    async fn remove_if_present(path: &Path) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(io_error(path)(source)),
        }
    }

    // ── Operations ─────────────────────────────────────────────────────────

    async fn lookup_entry(&self, request: &Request) -> Result<Option<Response>, StoreError> {
        let key = self.cache_key(request);
        let entries = self.load_entries(&key).await?;
        let Some(entry) = entries
            .into_iter()
            .find(|entry| requests_match(&entry.vary(), request.headers(), &entry.request))
        else {
            return Ok(None);
        };

        let Some(digest) = entry.response.get(DIGEST_HEADER) else {
            warn!(%key, "cache entry has no content digest");
            return Ok(None);
        };
        let body_path = self.path(digest);
        let body = match tokio::fs::read(&body_path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(%key, path = %body_path.display(), "cache body missing");
                return Ok(None);
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: body_path,
                    source,
                });
            }
        };

        restore_response(entry.response, body, || self.path(&key)).map(Some)
    }

    async fn write_entry(
        &self,
        request: &Request,
        response: &mut Response,
    ) -> Result<String, StoreError> {
        let key = self.cache_key(request);
        let stored_request = request.headers().clone();

        if !response.headers().contains(DIGEST_HEADER) {
            let digest = format!("en{}", hex::encode(Sha256::digest(response.content())));
            let body_path = self.path(&digest);
            let exists = tokio::fs::try_exists(&body_path)
                .await
                .map_err(|source| StoreError::Io {
                    path: body_path,
                    source,
                })?;
            if !exists {
                self.save(&digest, response.content()).await?;
            }
            response.headers_mut().set(DIGEST_HEADER, digest);
            if !response.headers().contains("transfer-encoding") {
                let length = response.content().len().to_string();
                response.headers_mut().set("Content-Length", length);
            }
        }

        let vary = response.headers().get_joined("vary").unwrap_or_default();
        let mut entries: Vec<StoredEntry> = self
            .load_entries(&key)
            .await?
            .into_iter()
            .filter(|entry| {
                entry.vary() != vary || !requests_match(&vary, &entry.request, &stored_request)
            })
            .collect();

        let mut headers = persist_response(response);
        headers.remove("age");
        entries.insert(
            0,
            StoredEntry {
                request: stored_request,
                response: headers,
            },
        );

        self.save_entries(&key, &entries).await?;
        debug!(%key, variants = entries.len(), "cache entry written");
        Ok(key)
    }

    async fn invalidate_entries(&self, request: &Request) -> Result<(), StoreError> {
        let key = self.cache_key(request);
        let mut entries = self.load_entries(&key).await?;
        let now = self.clock.now();
        let mut modified = false;

        for entry in &mut entries {
            let mut response = restore_response(entry.response.clone(), Vec::new(), || {
                self.path(&key)
            })?;
            if response.is_fresh(now) {
                response.expire(now);
                entry.response = persist_response(&response);
                modified = true;
            }
        }

        if modified {
            self.save_entries(&key, &entries).await?;
            debug!(%key, "cache entries expired");
        }
        Ok(())
    }

    async fn acquire_lock(&self, request: &Request) -> Result<LockOutcome, StoreError> {
        let key = self.cache_key(request);
        let path = self.lock_path(&key);
        if self.held_locks().contains_key(&key) {
            return Ok(LockOutcome::HeldBy(path));
        }

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(io_error(dir))?;
        }

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => {
                self.held_locks().insert(key, path);
                Ok(LockOutcome::Acquired)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(LockOutcome::HeldBy(path)),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    async fn release_lock(&self, request: &Request) -> Result<bool, StoreError> {
        let key = self.cache_key(request);
        let Some(path) = self.held_locks().remove(&key) else {
            return Ok(false);
        };
        Self::remove_if_present(&path).await
    }

    async fn check_lock(&self, request: &Request) -> Result<bool, StoreError> {
        let key = self.cache_key(request);
        if self.held_locks().contains_key(&key) {
            return Ok(true);
        }
        let path = self.lock_path(&key);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| StoreError::Io { path, source })
    }

    async fn purge_url(&self, url: &str) -> Result<bool, StoreError> {
        let key = key_for_uri(&Request::create(url, Method::Get).uri());
        let purged = Self::remove_if_present(&self.path(&key)).await?;
        debug!(%url, purged, "cache purge");
        Ok(purged)
    }

    async fn release_all(&self) -> Result<(), StoreError> {
        let held: Vec<PathBuf> = self.held_locks().drain().map(|(_, path)| path).collect();
        for path in held {
            Self::remove_if_present(&path).await?;
        }
        Ok(())
    }
}

impl Store for FileStore {
    fn lookup<'a>(
        &'a self,
        request: &'a Request,
    ) -> BoxFuture<'a, Result<Option<Response>, StoreError>> {
        Box::pin(self.lookup_entry(request))
    }

    fn write<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut Response,
    ) -> BoxFuture<'a, Result<String, StoreError>> {
        Box::pin(self.write_entry(request, response))
    }

    fn invalidate<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.invalidate_entries(request))
    }

    fn lock<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<LockOutcome, StoreError>> {
        Box::pin(self.acquire_lock(request))
    }

    fn unlock<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(self.release_lock(request))
    }

    fn is_locked<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(self.check_lock(request))
    }

    fn purge<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(self.purge_url(url))
    }

    fn cleanup(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(self.release_all())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        for (_, path) in self.held_locks().drain() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to release cache lock");
                }
            }
        }
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("root", &self.root)
            .field("locks", &self.held_locks().len())
            .finish()
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + use<> {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

fn key_for_uri(uri: &str) -> String {
    format!("md{}", hex::encode(Sha256::digest(uri.as_bytes())))
}

/// Returns `true` when every header named in `vary` has identical values in
/// both requests. Absent headers only match absent headers.
fn requests_match(vary: &str, current: &Headers, stored: &Headers) -> bool {
    split_vary(vary).iter().all(|name| {
        current
            .get_all(name)
            .eq(stored.get_all(name))
    })
}

/// Headers as persisted: everything the response carries plus `X-Status`.
fn persist_response(response: &Response) -> Headers {
    let mut headers = response.headers().clone();
    headers.set(STATUS_HEADER, response.status().as_u16().to_string());
    headers
}

fn restore_response(
    mut headers: Headers,
    body: Vec<u8>,
    location: impl FnOnce() -> PathBuf,
) -> Result<Response, StoreError> {
    let code = headers
        .get(STATUS_HEADER)
        .and_then(|s| s.trim().parse::<u16>().ok());
    let Some(status) = code.and_then(StatusCode::from_u16) else {
        return Err(StoreError::CorruptEntry {
            path: location(),
            reason: format!("bad {STATUS_HEADER} header: {code:?}"),
        });
    };
    headers.remove(STATUS_HEADER);
    Ok(Response::from_parts(status, headers, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FileStore, ManualClock) {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = FileStore::new(dir.path())
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (dir, store, clock)
    }

    fn fresh_response(clock: &ManualClock, body: &str) -> Response {
        let mut response = Response::new(StatusCode::Ok)
            .header("Cache-Control", "max-age=60")
            .body(body);
        response.set_date(clock.now());
        response
    }

    fn get(uri: &str) -> Request {
        Request::create(uri, Method::Get)
    }

    #[tokio::test]
    async fn write_then_lookup() {
        let (_dir, store, clock) = setup();
        let req = get("/page");
        let mut response = fresh_response(&clock, "hello").header("Age", "4");
        response.set_status(StatusCode::NotFound);

        let key = store.write(&req, &mut response).await.unwrap();
        assert_eq!(key, store.cache_key(&req));
        assert!(response.headers().get(DIGEST_HEADER).unwrap().starts_with("en"));
        assert_eq!(response.headers().get("content-length"), Some("5"));

        let cached = store.lookup(&req).await.unwrap().unwrap();
        assert_eq!(cached.status(), StatusCode::NotFound);
        assert_eq!(cached.content(), b"hello");
        assert_eq!(cached.headers().get("cache-control"), Some("max-age=60"));
        assert!(!cached.headers().contains("age"));
        assert!(!cached.headers().contains(STATUS_HEADER));
    }

    #[tokio::test]
    async fn keys_are_sharded() {
        let (dir, store, _clock) = setup();
        let key = store.cache_key(&get("/"));
        assert!(key.starts_with("md"));
        assert_eq!(key.len(), 2 + 64);
        let expected = dir
            .path()
            .join(&key[0..2])
            .join(&key[2..4])
            .join(&key[4..6])
            .join(&key[6..]);
        assert_eq!(store.path(&key), expected);
    }

    #[tokio::test]
    async fn lookup_of_unknown_uri_is_none() {
        let (_dir, store, _clock) = setup();
        assert!(store.lookup(&get("/nothing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn vary_variants_coexist() {
        let (_dir, store, clock) = setup();

        let mut en = get("/greeting");
        en.headers_mut().insert("Accept-Language", "en");
        let mut fr = get("/greeting");
        fr.headers_mut().insert("Accept-Language", "fr");

        let mut hello = fresh_response(&clock, "hello").header("Vary", "Accept-Language");
        let mut bonjour = fresh_response(&clock, "bonjour").header("Vary", "Accept-Language");
        store.write(&en, &mut hello).await.unwrap();
        store.write(&fr, &mut bonjour).await.unwrap();

        let got = store.lookup(&en).await.unwrap().unwrap();
        assert_eq!(got.content(), b"hello");
        let got = store.lookup(&fr).await.unwrap().unwrap();
        assert_eq!(got.content(), b"bonjour");

        let mut de = get("/greeting");
        de.headers_mut().insert("Accept-Language", "de");
        assert!(store.lookup(&de).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rewrite_replaces_matching_variant() {
        let (_dir, store, clock) = setup();
        let mut req = get("/greeting");
        req.headers_mut().insert("Accept-Language", "en");

        let mut first = fresh_response(&clock, "v1").header("Vary", "Accept-Language");
        store.write(&req, &mut first).await.unwrap();
        let mut second = fresh_response(&clock, "v2").header("Vary", "Accept-Language");
        store.write(&req, &mut second).await.unwrap();

        let entries = store.load_entries(&store.cache_key(&req)).await.unwrap();
        assert_eq!(entries.len(), 1);
        let got = store.lookup(&req).await.unwrap().unwrap();
        assert_eq!(got.content(), b"v2");
    }

    #[tokio::test]
    async fn identical_bodies_share_a_blob() {
        let (_dir, store, clock) = setup();
        let mut a = fresh_response(&clock, "same");
        let mut b = fresh_response(&clock, "same");
        store.write(&get("/a"), &mut a).await.unwrap();
        store.write(&get("/b"), &mut b).await.unwrap();
        assert_eq!(
            a.headers().get(DIGEST_HEADER),
            b.headers().get(DIGEST_HEADER)
        );
    }

    #[tokio::test]
    async fn missing_body_is_a_miss() {
        let (_dir, store, clock) = setup();
        let req = get("/gone");
        let mut response = fresh_response(&clock, "payload");
        store.write(&req, &mut response).await.unwrap();

        let digest = response.headers().get(DIGEST_HEADER).unwrap();
        std::fs::remove_file(store.path(digest)).unwrap();
        assert!(store.lookup(&req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalidate_expires_fresh_entries() {
        let (_dir, store, clock) = setup();
        let req = get("/news");
        let mut response = fresh_response(&clock, "headline");
        store.write(&req, &mut response).await.unwrap();

        store.invalidate(&req).await.unwrap();
        let cached = store.lookup(&req).await.unwrap().unwrap();
        assert_eq!(cached.headers().get("age"), Some("60"));
        assert!(!cached.is_fresh(clock.now()));
    }

    #[tokio::test]
    async fn invalidate_without_entries_is_a_no_op() {
        let (_dir, store, _clock) = setup();
        store.invalidate(&get("/never-cached")).await.unwrap();
    }

    #[tokio::test]
    async fn purge_reports_whether_anything_was_removed() {
        let (_dir, store, clock) = setup();
        let mut response = fresh_response(&clock, "x");
        store
            .write(&get("http://localhost/purge-me"), &mut response)
            .await
            .unwrap();

        assert!(store.purge("http://localhost/purge-me").await.unwrap());
        assert!(!store.purge("http://localhost/purge-me").await.unwrap());
        assert!(store.lookup(&get("/purge-me")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn locks_are_exclusive_across_stores() {
        let (dir, store, _clock) = setup();
        let other = FileStore::new(dir.path()).unwrap();
        let req = get("/hot");

        assert_eq!(store.lock(&req).await.unwrap(), LockOutcome::Acquired);
        assert!(store.is_locked(&req).await.unwrap());

        assert!(matches!(
            other.lock(&req).await.unwrap(),
            LockOutcome::HeldBy(_)
        ));
        assert!(other.is_locked(&req).await.unwrap());

        assert!(store.unlock(&req).await.unwrap());
        assert!(!store.unlock(&req).await.unwrap());
        assert!(!other.is_locked(&req).await.unwrap());
        assert!(other.lock(&req).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn a_held_lock_is_not_granted_twice() {
        let (_dir, store, _clock) = setup();
        let req = get("/hot");

        assert!(store.lock(&req).await.unwrap().is_acquired());
        assert_eq!(
            store.lock(&req).await.unwrap(),
            LockOutcome::HeldBy(store.lock_path(&store.cache_key(&req)))
        );

        assert!(store.unlock(&req).await.unwrap());
        assert!(!store.is_locked(&req).await.unwrap());
        assert!(store.lock(&req).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn concurrent_lockers_on_one_store_get_one_grant() {
        let (_dir, store, _clock) = setup();
        let req = get("/hot");

        let (a, b) = tokio::join!(store.lock(&req), store.lock(&req));
        let granted = [a.unwrap(), b.unwrap()]
            .iter()
            .filter(|outcome| outcome.is_acquired())
            .count();
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn unlock_leaves_foreign_locks_alone() {
        let (dir, store, _clock) = setup();
        let other = FileStore::new(dir.path()).unwrap();
        let req = get("/hot");

        assert!(store.lock(&req).await.unwrap().is_acquired());
        assert!(!other.unlock(&req).await.unwrap());
        assert!(other.is_locked(&req).await.unwrap());
        assert!(store.lock_path(&store.cache_key(&req)).exists());
    }

    #[tokio::test]
    async fn cleanup_releases_held_locks() {
        let (dir, store, _clock) = setup();
        let other = FileStore::new(dir.path()).unwrap();
        let req = get("/a");
        store.lock(&req).await.unwrap();
        store.lock(&get("/b")).await.unwrap();

        store.cleanup().await.unwrap();
        assert!(!other.is_locked(&req).await.unwrap());
    }

    #[tokio::test]
    async fn drop_releases_held_locks() {
        let (dir, store, _clock) = setup();
        let req = get("/a");
        store.lock(&req).await.unwrap();
        drop(store);

        let other = FileStore::new(dir.path()).unwrap();
        assert!(!other.is_locked(&req).await.unwrap());
    }

    #[tokio::test]
    async fn discarding_temp_files_tolerates_failures() {
        let (dir, _store, _clock) = setup();
        let tmp = dir.path().join(".leftover.tmp");
        std::fs::write(&tmp, b"partial").unwrap();

        FileStore::discard(&tmp).await;
        assert!(!tmp.exists());
        FileStore::discard(&tmp).await;
    }

    #[test]
    fn vary_matching_compares_all_values() {
        let a: Headers = [("Accept", "a"), ("Accept", "b")].into_iter().collect();
        let b: Headers = [("accept", "a"), ("accept", "b")].into_iter().collect();
        let c: Headers = [("Accept", "a")].into_iter().collect();
        assert!(requests_match("Accept", &a, &b));
        assert!(!requests_match("Accept", &a, &c));
        assert!(requests_match("", &a, &c));
        assert!(requests_match("X-None", &a, &c));
    }
}
