//! Bounded TTL cache for derived collections.
//!
//! Entries expire `ttl` after insertion; an expired entry is a miss and is
//! evicted on access or by [`Cache::cleanup`].  The bound is enforced at
//! insert time by evicting the *oldest-inserted* entry: reads never promote,
//! so eviction order is FIFO rather than LRU.

mod pattern;
mod registry;

pub use pattern::KeyPattern;
pub use registry::{CacheRegistry, Sweep};

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use pensieve_config::CollectionCacheConfig;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    /// TTL applied by [`Cache::set`].
    pub ttl: Duration,
    pub max_size: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::from(CollectionCacheConfig::default())
    }
}

impl From<CollectionCacheConfig> for CacheOptions {
    fn from(cfg: CollectionCacheConfig) -> Self {
        Self {
            ttl: Duration::from_secs(cfg.ttl_secs),
            max_size: cfg.max_entries,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
}

struct Entry<T> {
    value: T,
    inserted: Instant,
    ttl: Duration,
}

impl<T> Entry<T> {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted) > self.ttl
    }
}

struct State<T> {
    entries: LruCache<String, Entry<T>>,
    hits: u64,
    misses: u64,
}

pub struct Cache<T> {
    name: String,
    options: CacheOptions,
    state: Mutex<State<T>>,
}

impl<T> std::fmt::Debug for Cache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<T: Clone> Cache<T> {
    /// A `max_size` of zero is treated as one.
    pub fn new(name: impl Into<String>, options: CacheOptions) -> Self {
        let capacity = NonZeroUsize::new(options.max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            name: name.into(),
            options: CacheOptions {
                max_size: capacity.get(),
                ..options
            },
            state: Mutex::new(State {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> CacheOptions {
        self.options
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let mut state = self.state();
        let now = Instant::now();
        let expired = state.entries.peek(key).map(|entry| entry.expired(now));
        let hit = match expired {
            Some(false) => state.entries.peek(key).map(|entry| entry.value.clone()),
            Some(true) => {
                state.entries.pop(key);
                None
            }
            None => None,
        };
        if hit.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        hit
    }

    /// Live (non-expired) entry exists.  Does not count as a hit or miss.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state()
            .entries
            .peek(key)
            .is_some_and(|entry| !entry.expired(now))
    }

    pub fn set(&self, key: impl Into<String>, value: T) {
        self.set_with_ttl(key, value, self.options.ttl);
    }

    /// Insert with a per-entry TTL.  Re-setting an existing key replaces it
    /// and makes it the newest entry.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: T, ttl: Duration) {
        let key = key.into();
        let entry = Entry {
            value,
            inserted: Instant::now(),
            ttl,
        };
        let mut state = self.state();
        if let Some((evicted, _)) = state.entries.push(key.clone(), entry) {
            if evicted != key {
                debug!(cache = %self.name, key = %evicted, "evicted oldest entry");
            }
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.state().entries.pop(key).is_some()
    }

    /// Remove every key matching `pattern`; returns how many were removed.
    pub fn delete_matching(&self, pattern: &KeyPattern) -> usize {
        let mut state = self.state();
        let doomed: Vec<String> = state
            .entries
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            state.entries.pop(key);
        }
        if !doomed.is_empty() {
            debug!(cache = %self.name, pattern = pattern.as_str(), removed = doomed.len(), "invalidated");
        }
        doomed.len()
    }

    /// Glob form of [`delete_matching`](Self::delete_matching).  A glob that
    /// fails to compile matches nothing.
    pub fn delete_pattern(&self, glob: &str) -> usize {
        match KeyPattern::new(glob) {
            Ok(pattern) => self.delete_matching(&pattern),
            Err(err) => {
                warn!(cache = %self.name, pattern = glob, error = %err, "invalid cache key pattern");
                0
            }
        }
    }

    pub fn clear(&self) {
        self.state().entries.clear();
    }

    /// Drop expired entries; returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.entries.pop(key);
        }
        expired.len()
    }

    /// Every stored key, oldest first, including expired ones not yet swept.
    pub fn keys(&self) -> Vec<String> {
        self.state()
            .entries
            .iter()
            .rev()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state();
        CacheStats {
            size: state.entries.len(),
            max_size: self.options.max_size,
            hits: state.hits,
            misses: state.misses,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
