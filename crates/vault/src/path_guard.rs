//! Validation of untrusted path fragments before they reach the filesystem.
//!
//! Two layers, both required:
//!
//! 1. [`validate_segment`] is a pure syntactic check on a caller-supplied
//!    fragment (a project name, a sub-folder).  It never touches the disk.
//! 2. [`validate_within_root`] checks the final joined path against the vault
//!    root, including a symlink probe on the parent directory.  Even if a
//!    fragment slipped past layer 1, the write cannot leave the vault.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{VaultError, VaultResult};

/// Maximum length of a multi-component sub-path.
pub const MAX_SUB_PATH_LEN: usize = 200;
/// Maximum length of a single-component name.
pub const MAX_NAME_LEN: usize = 100;
/// Maximum length of a document file name.
pub const MAX_FILE_NAME_LEN: usize = 255;

const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// What a fragment is going to be used as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// A relative folder path such as `project-alpha/meetings`.  Empty input
    /// means "no sub-path" and is accepted.
    SubPath,
    /// A single directory name such as a project name.  Must be non-empty.
    Name,
}

impl SegmentKind {
    fn label(self) -> &'static str {
        match self {
            Self::SubPath => "sub-path",
            Self::Name => "name",
        }
    }

    fn max_len(self) -> usize {
        match self {
            Self::SubPath => MAX_SUB_PATH_LEN,
            Self::Name => MAX_NAME_LEN,
        }
    }

    fn allows(self, ch: char) -> bool {
        ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || (self == Self::SubPath && ch == '/')
    }
}

/// Validate an untrusted path fragment.
///
/// Returns the trimmed fragment unchanged when it passes.  The first rule
/// violated determines the error.
pub fn validate_segment(raw: &str, kind: SegmentKind) -> VaultResult<String> {
    let label = kind.label();
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return match kind {
            SegmentKind::SubPath => Ok(String::new()),
            SegmentKind::Name => Err(VaultError::invalid_path("name cannot be empty")),
        };
    }

    if looks_absolute(trimmed) {
        return Err(VaultError::invalid_path(format!(
            "absolute paths are not allowed in {label}"
        )));
    }

    if trimmed.contains("..") {
        return Err(VaultError::invalid_path(format!(
            "parent directory references (..) are not allowed in {label}"
        )));
    }

    if kind == SegmentKind::Name && (trimmed.contains('/') || trimmed.contains('\\')) {
        return Err(VaultError::invalid_path(
            "slashes are not allowed in name (must be a single directory name)",
        ));
    }

    if trimmed.contains('\0') {
        return Err(VaultError::invalid_path(format!(
            "null bytes are not allowed in {label}"
        )));
    }

    let max = kind.max_len();
    if trimmed.chars().count() > max {
        return Err(VaultError::invalid_path(format!(
            "{label} too long (max {max} characters)"
        )));
    }

    if !trimmed.chars().all(|ch| kind.allows(ch)) {
        let allowed = match kind {
            SegmentKind::SubPath => "alphanumeric, -, _, /",
            SegmentKind::Name => "alphanumeric, -, _",
        };
        return Err(VaultError::invalid_path(format!(
            "{label} contains invalid characters (only {allowed} allowed)"
        )));
    }

    if kind == SegmentKind::Name {
        let upper = trimmed.to_ascii_uppercase();
        if RESERVED_NAMES.contains(&upper.as_str()) {
            return Err(VaultError::invalid_path(format!(
                "name \"{trimmed}\" is a reserved system name"
            )));
        }
        if trimmed.starts_with('.') {
            return Err(VaultError::invalid_path(
                "name cannot start with . (hidden files not allowed)",
            ));
        }
    }

    Ok(trimmed.to_string())
}

/// Validate a document file name such as `2024-01-01.md`.
///
/// Looser than [`SegmentKind::Name`] (dots and spaces are fine) but still a
/// single visible component.
pub fn validate_file_name(raw: &str) -> VaultResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(VaultError::invalid_path("file name cannot be empty"));
    }
    if trimmed.contains('/') || trimmed.contains('\\') {
        return Err(VaultError::invalid_path(
            "slashes are not allowed in file name",
        ));
    }
    if trimmed.contains("..") {
        return Err(VaultError::invalid_path(
            "parent directory references (..) are not allowed in file name",
        ));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(VaultError::invalid_path(
            "control characters are not allowed in file name",
        ));
    }
    if trimmed.starts_with('.') {
        return Err(VaultError::invalid_path(
            "file name cannot start with . (hidden files not allowed)",
        ));
    }
    if trimmed.chars().count() > MAX_FILE_NAME_LEN {
        return Err(VaultError::invalid_path(format!(
            "file name too long (max {MAX_FILE_NAME_LEN} characters)"
        )));
    }
    Ok(trimmed.to_string())
}

/// Validate `sub_path` and `file_name`, join them onto `root`, and check the
/// result stays inside it.
pub async fn resolve(root: &Path, sub_path: &str, file_name: &str) -> VaultResult<PathBuf> {
    let sub_path = validate_segment(sub_path, SegmentKind::SubPath)?;
    let file_name = validate_file_name(file_name)?;
    let candidate = root.join(sub_path).join(file_name);
    validate_within_root(&candidate, root).await
}

/// POSIX roots, Windows roots (`\x`, `\\server`), and drive prefixes (`C:`).
fn looks_absolute(s: &str) -> bool {
    if s.starts_with('/') || s.starts_with('\\') {
        return true;
    }
    let bytes = s.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Lexically resolve `.` and `..` against an absolute form of `path`
/// *without* following symlinks.
///
/// Works for paths that do not exist yet, which `canonicalize()` cannot do.
pub fn normalize(path: &Path) -> VaultResult<PathBuf> {
    lexical_absolute(path).map_err(|err| VaultError::io(path, err))
}

pub(crate) fn lexical_absolute(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Check that `candidate` resolves strictly inside `root`.
///
/// Comparison is component-wise on normalized absolute paths, so a sibling
/// such as `/vault-evil` never matches a root of `/vault`.  When the parent
/// directory of `candidate` exists its symlinks are resolved and checked as
/// well; a missing parent skips that probe (it will be created later and is
/// covered by the literal check).
///
/// Returns the normalized candidate.
pub async fn validate_within_root(candidate: &Path, root: &Path) -> VaultResult<PathBuf> {
    let resolved = normalize(candidate)?;
    let resolved_root = normalize(root)?;

    if resolved == resolved_root || !resolved.starts_with(&resolved_root) {
        warn!(
            attempted = %resolved.display(),
            root = %resolved_root.display(),
            "path escapes vault root"
        );
        return Err(VaultError::SecurityViolation {
            detail: "destination path is outside vault directory",
            attempted: resolved,
            root: resolved_root,
        });
    }

    let Some(parent) = resolved.parent() else {
        return Ok(resolved);
    };

    match tokio::fs::canonicalize(parent).await {
        Ok(real_parent) => {
            // The root itself may sit behind a symlink (e.g. /tmp on macOS).
            let real_root = tokio::fs::canonicalize(&resolved_root)
                .await
                .unwrap_or_else(|_| resolved_root.clone());
            if !real_parent.starts_with(&real_root) {
                warn!(
                    real_parent = %real_parent.display(),
                    root = %real_root.display(),
                    "symlink traversal detected"
                );
                return Err(VaultError::SecurityViolation {
                    detail: "symlink traversal detected",
                    attempted: real_parent,
                    root: real_root,
                });
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(parent = %parent.display(), "parent does not exist yet; symlink probe skipped");
        }
        Err(err) => {
            // Literal check already passed; a failed probe alone is not fatal.
            warn!(parent = %parent.display(), error = %err, "path validation warning");
        }
    }

    Ok(resolved)
}

// ── Tests ────────────────────────────────────────────────────────────────────
