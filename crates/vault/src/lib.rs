//! Storage engine for a markdown knowledge vault.
//!
//! Documents are plain files: a YAML frontmatter block plus a markdown body,
//! laid out under a single root directory.  The engine provides:
//!
//! - [`path_guard`]: validation of untrusted path fragments and the vault
//!   boundary check.
//! - [`lock`]: per-file exclusive locks with backoff and stale-lock recovery.
//! - [`store`]: locked, atomic file I/O.
//! - [`frontmatter`]: the document codec.
//! - [`cache`]: TTL caches for derived collections plus their sweeper.
//! - [`collection`] and [`vault`]: the pieces above wired into cached,
//!   folder-scoped document sets.

pub mod cache;
pub mod collection;
pub mod error;
pub mod frontmatter;
pub mod layout;
pub mod lock;
pub mod path_guard;
pub mod store;
pub mod vault;

pub use cache::{Cache, CacheOptions, CacheRegistry, CacheStats, KeyPattern, Sweep};
pub use collection::{CollectionSet, DocumentCollection, Listing, StoredDocument};
pub use error::{CodecError, LockError, VaultError, VaultResult};
pub use frontmatter::{Document, FieldCheck, Metadata};
pub use layout::{Folder, LayoutReport, VaultLayout};
pub use lock::{LockGuard, LockManager, LockOptions};
pub use path_guard::SegmentKind;
pub use store::{DocumentStore, ListOptions};
pub use vault::Vault;
