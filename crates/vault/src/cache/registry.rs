use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Cache, CacheOptions};

/// Type-erased view of a cache, enough for periodic maintenance.
pub trait Sweep: Send + Sync {
    fn name(&self) -> &str;
    /// Drop expired entries; returns how many were removed.
    fn cleanup(&self) -> usize;
    fn clear(&self);
}

impl<T: Clone + Send> Sweep for Cache<T> {
    fn name(&self) -> &str {
        Cache::name(self)
    }

    fn cleanup(&self) -> usize {
        Cache::cleanup(self)
    }

    fn clear(&self) {
        Cache::clear(self)
    }
}

type Caches = Arc<Mutex<Vec<Arc<dyn Sweep>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the process's caches and the optional background sweep.
///
/// The sweeper only runs between [`start`](Self::start) and
/// [`stop`](Self::stop); nothing starts it implicitly.
#[derive(Default)]
pub struct CacheRegistry {
    caches: Caches,
    sweeper: Mutex<Option<Sweeper>>,
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = lock(&self.caches)
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        f.debug_struct("CacheRegistry")
            .field("caches", &names)
            .field("running", &self.is_running())
            .finish()
    }
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cache: Arc<dyn Sweep>) {
        lock(&self.caches).push(cache);
    }

    /// Build a cache and register it in one step.
    pub fn create<T>(&self, name: impl Into<String>, options: CacheOptions) -> Arc<Cache<T>>
    where
        T: Clone + Send + 'static,
    {
        let cache = Arc::new(Cache::new(name, options));
        self.register(cache.clone());
        cache
    }

    pub fn len(&self) -> usize {
        lock(&self.caches).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `cleanup` on every registered cache; returns total removed.
    pub fn sweep_all(&self) -> usize {
        sweep(&self.caches)
    }

    pub fn clear_all(&self) {
        for cache in snapshot(&self.caches) {
            cache.clear();
        }
    }

    /// Start the periodic sweep.  Returns `false` (and changes nothing) if it
    /// is already running or there is no tokio runtime to run it on.
    pub fn start(&self, interval: Duration) -> bool {
        let mut slot = lock(&self.sweeper);
        if slot.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            return false;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("no tokio runtime, cache sweeper not started");
            return false;
        };

        let interval = interval.max(Duration::from_millis(1));
        let (shutdown, mut rx) = watch::channel(false);
        let caches = Arc::clone(&self.caches);
        let handle = runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let removed = sweep(&caches);
                        if removed > 0 {
                            info!(removed, "cache sweep complete");
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("cache sweeper exited");
        });

        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        info!(interval_ms, "cache sweeper started");
        *slot = Some(Sweeper { shutdown, handle });
        true
    }

    /// Stop the periodic sweep.  Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        let Some(sweeper) = lock(&self.sweeper).take() else {
            return false;
        };
        let _ = sweeper.shutdown.send(true);
        info!("cache sweeper stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        lock(&self.sweeper)
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }
}

impl Drop for CacheRegistry {
    fn drop(&mut self) {
        if let Some(sweeper) = lock(&self.sweeper).take() {
            sweeper.handle.abort();
        }
    }
}

/// Clone the list so no cache lock is taken while the registry lock is held.
fn snapshot(caches: &Caches) -> Vec<Arc<dyn Sweep>> {
    lock(caches).clone()
}

fn sweep(caches: &Caches) -> usize {
    snapshot(caches)
        .iter()
        .map(|cache| {
            let removed = cache.cleanup();
            if removed > 0 {
                debug!(cache = cache.name(), removed, "expired entries dropped");
            }
            removed
        })
        .sum()
}
