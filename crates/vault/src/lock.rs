//! Per-file exclusive locks for mutating vault operations.
//!
//! A lock is two things:
//!
//! - an entry in the process-wide registry held by [`LockManager`], which
//!   serializes tasks inside this process, and
//! - (optionally) a `<file>.lock` marker created with `O_EXCL`, so other
//!   processes sharing the vault directory see the lock too.
//!
//! Both are keyed on the lexically normalized absolute path, so `a/./b.md`
//! and `a/b.md` contend for the same lock.  Symlinks are not resolved.
//!
//! A lock older than `stale` is presumed abandoned and is reclaimed by the
//! next caller with a warning.  This keeps a crashed writer from wedging a
//! file forever, at the cost of breaking a holder that legitimately runs
//! longer than `stale`.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use pensieve_config::LockConfig;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LockError;
use crate::path_guard::lexical_absolute;

/// Outer attempts made by [`LockManager::with_retried_lock`] by default.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 10;

const MARKER_SUFFIX: &str = ".lock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Total time budget for one acquisition.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub retries: u32,
    /// Age after which a held lock may be reclaimed.
    pub stale: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub marker_files: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for LockOptions {
    fn from(cfg: &LockConfig) -> Self {
        Self {
            timeout: Duration::from_millis(cfg.timeout_ms),
            retries: cfg.retries,
            stale: Duration::from_millis(cfg.stale_ms),
            min_backoff: Duration::from_millis(cfg.min_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            marker_files: cfg.marker_files,
        }
    }
}

impl LockOptions {
    /// Delay before retry number `attempt` (0-based): doubling from
    /// `min_backoff`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.min_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy)]
struct HeldLock {
    token: Uuid,
    acquired_at: Instant,
}

type Registry = Arc<Mutex<HashMap<PathBuf, HeldLock>>>;

fn registry(map: &Registry) -> MutexGuard<'_, HashMap<PathBuf, HeldLock>> {
    // A panic while holding the map cannot leave it half-updated.
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn marker_path(key: &Path) -> PathBuf {
    let mut os = key.as_os_str().to_owned();
    os.push(MARKER_SUFFIX);
    PathBuf::from(os)
}

/// Hands out per-path exclusive locks.  Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct LockManager {
    held: Registry,
    options: LockOptions,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(LockOptions::default())
    }
}

impl LockManager {
    pub fn new(options: LockOptions) -> Self {
        Self {
            held: Arc::new(Mutex::new(HashMap::new())),
            options,
        }
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Acquire `path` with the manager's default options.
    pub async fn acquire(&self, path: &Path) -> Result<LockGuard, LockError> {
        self.acquire_with(path, &self.options).await
    }

    /// Acquire `path`, retrying with exponential backoff until `opts.retries`
    /// is spent or `opts.timeout` elapses.
    pub async fn acquire_with(
        &self,
        path: &Path,
        opts: &LockOptions,
    ) -> Result<LockGuard, LockError> {
        let key = lock_key(path)?;
        let started = Instant::now();
        let deadline = started + opts.timeout;
        let mut attempt = 0u32;

        loop {
            if let Some(guard) = self.try_acquire(&key, opts).await? {
                debug!(path = %key.display(), attempt, "lock acquired");
                return Ok(guard);
            }

            if attempt >= opts.retries {
                return Err(LockError::Held {
                    path: key,
                    attempts: attempt + 1,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    path: key,
                    waited_ms: duration_ms(now - started),
                });
            }

            let delay = opts.backoff(attempt).min(deadline - now);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Run `f` while holding the lock on `path`.
    ///
    /// `f` runs at most once.  The lock is released however `f` finishes,
    /// including when the returned future is dropped mid-flight; a release
    /// failure is logged and never replaces `f`'s own result.
    pub async fn with_lock<F, Fut, T, E>(&self, path: &Path, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        self.with_lock_opts(path, &self.options, f).await
    }

    /// [`with_lock`](Self::with_lock) with per-call acquisition options.
    pub async fn with_lock_opts<F, Fut, T, E>(
        &self,
        path: &Path,
        opts: &LockOptions,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let guard = self.acquire_with(path, opts).await?;
        let result = f().await;
        guard.release();
        result
    }

    /// Like [`with_lock`](Self::with_lock) but for heavily contended paths.
    ///
    /// Up to `max_attempts` acquisitions are made.  Attempt `n` (0-based) gets
    /// a `2s + n·1s` timeout with three inner retries; between attempts the
    /// caller waits `min(100ms · 2ⁿ, 5s)`.  Only acquisition is retried: once
    /// the lock is held `f` runs exactly once and its error is returned as is.
    pub async fn with_retried_lock<F, Fut, T, E>(
        &self,
        path: &Path,
        max_attempts: u32,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            let opts = LockOptions {
                timeout: Duration::from_secs(2 + u64::from(attempt)),
                retries: 3,
                ..self.options.clone()
            };

            match self.acquire_with(path, &opts).await {
                Ok(guard) => {
                    let result = f().await;
                    guard.release();
                    return result;
                }
                Err(err) if attempt + 1 >= max_attempts => {
                    return Err(LockError::Exhausted {
                        attempts: max_attempts,
                        last: Box::new(err),
                    }
                    .into());
                }
                Err(err) => {
                    let delay = Duration::from_millis(
                        100u64.saturating_mul(1u64 << attempt.min(16)).min(5_000),
                    );
                    warn!(
                        path = %path.display(),
                        attempt = attempt + 1,
                        max_attempts,
                        error = %err,
                        "lock acquisition failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// True when a live (non-stale) lock exists on `path`, in this process or
    /// via a marker file left by another.
    pub async fn is_locked(&self, path: &Path) -> bool {
        let Ok(key) = lock_key(path) else {
            return false;
        };

        let live = registry(&self.held)
            .get(&key)
            .is_some_and(|held| held.acquired_at.elapsed() <= self.options.stale);
        if live {
            return true;
        }

        self.options.marker_files && !marker_is_stale(&marker_path(&key), self.options.stale).await
    }

    /// Drop any lock on `path` regardless of holder.  Returns whether
    /// anything was removed.  Meant for operator recovery only.
    pub async fn force_unlock(&self, path: &Path) -> Result<bool, LockError> {
        let key = lock_key(path)?;
        let mut removed = registry(&self.held).remove(&key).is_some();

        if self.options.marker_files {
            let marker = marker_path(&key);
            match tokio::fs::remove_file(&marker).await {
                Ok(()) => removed = true,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(LockError::Marker {
                        path: marker,
                        source,
                    });
                }
            }
        }

        if removed {
            warn!(path = %key.display(), "lock forcibly released");
        }
        Ok(removed)
    }

    async fn try_acquire(
        &self,
        key: &Path,
        opts: &LockOptions,
    ) -> Result<Option<LockGuard>, LockError> {
        let token = Uuid::new_v4();
        if !self.claim(key, token, opts.stale) {
            return Ok(None);
        }

        let mut marker = None;
        if opts.marker_files {
            match create_marker(key, token, opts.stale).await {
                Ok(MarkerOutcome::Created(path)) => marker = Some(path),
                Ok(MarkerOutcome::NoParent) => {}
                Ok(MarkerOutcome::Busy) => {
                    self.unclaim(key, token);
                    return Ok(None);
                }
                Err(err) => {
                    self.unclaim(key, token);
                    return Err(err);
                }
            }
        }

        Ok(Some(LockGuard {
            key: key.to_path_buf(),
            token,
            marker,
            held: Arc::clone(&self.held),
            released: false,
        }))
    }

    /// Take the in-process slot for `key`, reclaiming it if stale.
    fn claim(&self, key: &Path, token: Uuid, stale: Duration) -> bool {
        let mut held = registry(&self.held);
        if let Some(existing) = held.get(key) {
            let age = existing.acquired_at.elapsed();
            if age <= stale {
                return false;
            }
            warn!(
                path = %key.display(),
                age_ms = duration_ms(age),
                "reclaiming stale lock"
            );
        }
        held.insert(
            key.to_path_buf(),
            HeldLock {
                token,
                acquired_at: Instant::now(),
            },
        );
        true
    }

    fn unclaim(&self, key: &Path, token: Uuid) {
        let mut held = registry(&self.held);
        if held.get(key).is_some_and(|h| h.token == token) {
            held.remove(key);
        }
    }
}

fn lock_key(path: &Path) -> Result<PathBuf, LockError> {
    lexical_absolute(path).map_err(|source| LockError::Marker {
        path: path.to_path_buf(),
        source,
    })
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

enum MarkerOutcome {
    Created(PathBuf),
    /// The locked file's directory does not exist, so there is nothing on
    /// disk for another process to contend on.  Fall back to the registry.
    NoParent,
    Busy,
}

async fn create_marker(
    key: &Path,
    token: Uuid,
    stale: Duration,
) -> Result<MarkerOutcome, LockError> {
    let marker = marker_path(key);
    let marker_err = |source| LockError::Marker {
        path: marker.clone(),
        source,
    };

    // Second pass only happens after removing a stale marker.
    for _ in 0..2 {
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
            .await;

        match opened {
            Ok(mut file) => {
                let written = async {
                    file.write_all(token.to_string().as_bytes()).await?;
                    file.flush().await
                }
                .await;
                if let Err(err) = written {
                    let _ = tokio::fs::remove_file(&marker).await;
                    return Err(marker_err(err));
                }
                return Ok(MarkerOutcome::Created(marker));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if !marker_is_stale(&marker, stale).await {
                    return Ok(MarkerOutcome::Busy);
                }
                warn!(marker = %marker.display(), "removing stale lock marker");
                match tokio::fs::remove_file(&marker).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(marker_err(err)),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(marker = %marker.display(), "no parent directory, registry lock only");
                return Ok(MarkerOutcome::NoParent);
            }
            Err(err) => return Err(marker_err(err)),
        }
    }

    Ok(MarkerOutcome::Busy)
}

/// A marker is stale when its mtime is older than `stale`, or when it has
/// vanished.  Unreadable metadata counts as live.
async fn marker_is_stale(marker: &Path, stale: Duration) -> bool {
    match tokio::fs::metadata(marker).await {
        Ok(meta) => meta
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .is_some_and(|age| age > stale),
        Err(err) => err.kind() == std::io::ErrorKind::NotFound,
    }
}

/// Proof of exclusive access to one path.  Released on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    key: PathBuf,
    token: Uuid,
    marker: Option<PathBuf>,
    held: Registry,
    released: bool,
}

impl LockGuard {
    /// The normalized path this guard locks.
    pub fn path(&self) -> &Path {
        &self.key
    }

    /// Release now rather than at end of scope.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        {
            let mut held = registry(&self.held);
            // A stale-lock thief may own the slot by now.
            if held.get(&self.key).is_some_and(|h| h.token == self.token) {
                held.remove(&self.key);
            }
        }

        let Some(marker) = self.marker.take() else {
            return;
        };
        match std::fs::read_to_string(&marker) {
            Ok(contents) if contents.trim() == self.token.to_string() => {
                if let Err(err) = std::fs::remove_file(&marker) {
                    warn!(marker = %marker.display(), error = %err, "failed to remove lock marker");
                }
            }
            Ok(_) => {
                debug!(marker = %marker.display(), "marker owned by another holder, left in place");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(marker = %marker.display(), error = %err, "failed to read lock marker");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
