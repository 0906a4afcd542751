use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ── Vault config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault root directory.  Relative paths are resolved against the current
    /// working directory when the vault is opened.  `VAULT_PATH` overrides it.
    pub path: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: "./vault".to_string(),
        }
    }
}

// ── Lock config ──────────────────────────────────────────────────────────────

/// Advisory file-lock tuning.
///
/// Backoff between acquisition attempts starts at `min_backoff_ms` and doubles
/// up to `max_backoff_ms`.  A lock older than `stale_ms` is presumed abandoned
/// and may be reclaimed by the next caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub timeout_ms: u64,
    pub retries: u32,
    pub stale_ms: u64,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Create a `<file>.lock` sibling marker so other processes sharing the
    /// vault observe the lock.  Disable only for single-process deployments.
    pub marker_files: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            retries: 5,
            stale_ms: 10_000,
            min_backoff_ms: 100,
            max_backoff_ms: 1_000,
            marker_files: true,
        }
    }
}

// ── Cache config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionCacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl CollectionCacheConfig {
    pub const fn new(ttl_secs: u64, max_entries: usize) -> Self {
        Self {
            ttl_secs,
            max_entries,
        }
    }
}

impl Default for CollectionCacheConfig {
    fn default() -> Self {
        Self::new(300, 1_000)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How often the background sweeper drops expired entries.
    pub sweep_interval_secs: u64,
    pub notes: CollectionCacheConfig,
    /// Journals change more often than notes, so they expire sooner.
    pub journals: CollectionCacheConfig,
    pub projects: CollectionCacheConfig,
    pub chats: CollectionCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            notes: CollectionCacheConfig::new(300, 1_000),
            journals: CollectionCacheConfig::new(120, 500),
            projects: CollectionCacheConfig::new(600, 200),
            chats: CollectionCacheConfig::new(300, 500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub vault: VaultConfig,
    pub locks: LockConfig,
    pub cache: CacheConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)
                .with_context(|| format!("parse config file {}", path.display()))?;
        }

        // Vault location env override (takes precedence over config file).
        if let Ok(value) = env::var("VAULT_PATH") {
            if !value.trim().is_empty() {
                config.vault.path = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// The configured vault root as an absolute path.
    pub fn vault_root(&self) -> Result<PathBuf> {
        std::path::absolute(&self.vault.path)
            .with_context(|| format!("resolve vault path {}", self.vault.path))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // ── Lock defaults ──────────────────────────────────────────────────────
    // These mirror the acquisition budget callers rely on.  Changing them
    // alters how long a busy vault blocks a request.

    #[test]
    fn lock_defaults() {
        let locks = LockConfig::default();
        assert_eq!(locks.timeout_ms, 5_000);
        assert_eq!(locks.retries, 5);
        assert_eq!(locks.stale_ms, 10_000);
        assert_eq!(locks.min_backoff_ms, 100);
        assert_eq!(locks.max_backoff_ms, 1_000);
        assert!(locks.marker_files);
    }

    #[test]
    fn cache_defaults() {
        let cache = CacheConfig::default();
        assert_eq!(cache.sweep_interval_secs, 300);
        assert_eq!(cache.notes, CollectionCacheConfig::new(300, 1_000));
        assert_eq!(cache.journals, CollectionCacheConfig::new(120, 500));
        assert_eq!(cache.projects, CollectionCacheConfig::new(600, 200));
        assert_eq!(cache.chats, CollectionCacheConfig::new(300, 500));
    }

    #[test]
    fn cosmetic_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.vault.path, "./vault");
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.locks.retries, 5);
        assert_eq!(cfg.cache.notes.max_entries, 1_000);
    }

    #[test]
    fn load_from_valid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.toml");
        fs::write(
            &path,
            r#"
[locks]
timeout_ms = 2000
retries = 3
stale_ms = 4000
marker_files = false

[cache]
sweep_interval_secs = 60

[cache.journals]
ttl_secs = 30
max_entries = 10

[telemetry]
log_level = "debug"
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.locks.timeout_ms, 2_000);
        assert_eq!(cfg.locks.retries, 3);
        assert_eq!(cfg.locks.stale_ms, 4_000);
        assert!(!cfg.locks.marker_files);
        // Unspecified lock fields keep their defaults
        assert_eq!(cfg.locks.min_backoff_ms, 100);
        assert_eq!(cfg.cache.sweep_interval_secs, 60);
        assert_eq!(cfg.cache.journals, CollectionCacheConfig::new(30, 10));
        assert_eq!(cfg.cache.projects, CollectionCacheConfig::new(600, 200));
        assert_eq!(cfg.telemetry.log_level, "debug");
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    // ── save_to + roundtrip ────────────────────────────────────────────────

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.locks.retries = 9;
        cfg.cache.notes = CollectionCacheConfig::new(10, 20);
        cfg.telemetry.log_level = "warn".to_string();

        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.locks.retries, 9);
        assert_eq!(loaded.cache.notes, CollectionCacheConfig::new(10, 20));
        assert_eq!(loaded.telemetry.log_level, "warn");
    }

    #[test]
    fn collection_cache_config_serde_roundtrip() {
        let cfg = CollectionCacheConfig::new(42, 7);
        let json = serde_json::to_string(&cfg).unwrap();
        assert_eq!(json, r#"{"ttl_secs":42,"max_entries":7}"#);
        let back: CollectionCacheConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    // ── Env var overrides ──────────────────────────────────────────────────

    #[test]
    fn env_vault_path_overrides_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.toml");
        fs::write(
            &path,
            r#"
[vault]
path = "/from/file"
"#,
        )
        .unwrap();

        // SAFETY: no other test in this crate asserts on `vault.path`.
        unsafe { env::set_var("VAULT_PATH", "/from/env") };
        let cfg = AppConfig::load_from(&path).unwrap();
        unsafe { env::remove_var("VAULT_PATH") };
        assert_eq!(cfg.vault.path, "/from/env");
        assert_eq!(cfg.vault_root().unwrap(), PathBuf::from("/from/env"));
    }
}
