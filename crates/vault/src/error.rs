//! Error types for the vault storage engine.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias used throughout the crate.
pub type VaultResult<T> = Result<T, VaultError>;

/// Everything the engine can fail with.
///
/// `InvalidPath` and `SecurityViolation` are raised before any filesystem
/// access.  Callers should surface `SecurityViolation` as a rejected request
/// and never echo `attempted` back to an untrusted client.
#[derive(Debug, Error)]
pub enum VaultError {
    /// A caller-supplied path fragment failed syntactic validation.
    #[error("invalid path: {reason}")]
    InvalidPath { reason: String },

    /// A resolved path would land outside the vault root.
    #[error("security violation: {detail} (attempted {}, root {})", .attempted.display(), .root.display())]
    SecurityViolation {
        detail: &'static str,
        attempted: PathBuf,
        root: PathBuf,
    },

    /// Exclusive access could not be obtained within the retry budget.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Underlying filesystem failure, with the path it concerned.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The stored document could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl VaultError {
    pub(crate) fn invalid_path(reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// True for `Io` errors whose kind is `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Lock acquisition failures.  Always recoverable by retrying later.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder kept the lock through every retry.
    #[error("lock held: {} is locked by another holder ({attempts} attempts)", .path.display())]
    Held { path: PathBuf, attempts: u32 },

    /// The acquisition deadline elapsed before the lock came free.
    #[error("lock timeout: gave up on {} after {waited_ms} ms", .path.display())]
    Timeout { path: PathBuf, waited_ms: u64 },

    /// `with_retried_lock` ran out of outer attempts.
    #[error("failed to acquire lock after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<LockError>,
    },

    /// The marker file could not be created or inspected.
    #[error("lock marker I/O error on {}: {source}", .path.display())]
    Marker {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    /// The locked path this error refers to, when there is one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Held { path, .. } | Self::Timeout { path, .. } | Self::Marker { path, .. } => {
                Some(path)
            }
            Self::Exhausted { last, .. } => last.path(),
        }
    }
}

/// Frontmatter decoding failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// An opening `---` without a matching closing delimiter.
    #[error("unterminated metadata block")]
    Unterminated,

    /// The block is not valid YAML.
    #[error("malformed metadata block: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The block parsed, but not to a key/value mapping.
    #[error("metadata block must be a mapping, found {found}")]
    NotAMapping { found: &'static str },
}
