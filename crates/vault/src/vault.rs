use std::path::{Path, PathBuf};
use std::time::Duration;

use pensieve_config::{AppConfig, CacheConfig};
use tracing::info;

use crate::cache::{CacheOptions, CacheRegistry};
use crate::collection::{CollectionSet, DocumentCollection};
use crate::error::{VaultError, VaultResult};
use crate::layout::{Folder, VaultLayout};
use crate::lock::{LockManager, LockOptions};
use crate::path_guard::{self, SegmentKind};
use crate::store::DocumentStore;

/// An opened vault: root directory, store, caches and the standard
/// collections, wired together.
#[derive(Debug)]
pub struct Vault {
    root: PathBuf,
    layout: VaultLayout,
    store: DocumentStore,
    caches: CacheRegistry,
    collections: CollectionSet,
    sweep_interval: Duration,
    notes: DocumentCollection,
    journals: DocumentCollection,
    projects: DocumentCollection,
    chats: DocumentCollection,
}

impl Vault {
    pub fn from_config(config: &AppConfig) -> VaultResult<Self> {
        Self::open(
            &config.vault.path,
            LockOptions::from(&config.locks),
            &config.cache,
        )
    }

    /// Open the vault at `root`.  Nothing is created on disk; see
    /// [`VaultLayout::create`].
    pub fn open(
        root: impl AsRef<Path>,
        locks: LockOptions,
        cache: &CacheConfig,
    ) -> VaultResult<Self> {
        let root = root.as_ref();
        if root.as_os_str().is_empty() {
            return Err(VaultError::invalid_path("vault root cannot be empty"));
        }
        let root = path_guard::normalize(root)?;

        let store = DocumentStore::new(LockManager::new(locks));
        let caches = CacheRegistry::new();
        let collections = CollectionSet::new();

        let build = |name: &str, folders: &[Folder], options: CacheOptions| {
            DocumentCollection::new(
                name,
                root.clone(),
                folders,
                store.clone(),
                caches.create(name, options),
            )
            .join(&collections)
        };
        let notes = build("notes", &Folder::NOTES[..], cache.notes.into());
        let journals = build("journals", &[Folder::Journal][..], cache.journals.into());
        let projects = build("projects", &[Folder::Projects][..], cache.projects.into());
        let chats = build("chats", &[Folder::Chat][..], cache.chats.into());

        info!(root = %root.display(), "vault opened");
        Ok(Self {
            layout: VaultLayout::new(root.clone()),
            root,
            store,
            caches,
            collections,
            sweep_interval: Duration::from_secs(cache.sweep_interval_secs),
            notes,
            journals,
            projects,
            chats,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> &VaultLayout {
        &self.layout
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn caches(&self) -> &CacheRegistry {
        &self.caches
    }

    pub fn notes(&self) -> &DocumentCollection {
        &self.notes
    }

    pub fn journals(&self) -> &DocumentCollection {
        &self.journals
    }

    pub fn projects(&self) -> &DocumentCollection {
        &self.projects
    }

    pub fn chats(&self) -> &DocumentCollection {
        &self.chats
    }

    /// A custom collection whose cache is registered with this vault and
    /// which invalidates, and is invalidated by, the standard collections.
    pub fn collection(
        &self,
        name: &str,
        folders: &[Folder],
        options: CacheOptions,
    ) -> DocumentCollection {
        let cache = self.caches.create(name, options);
        DocumentCollection::new(name, self.root.clone(), folders, self.store.clone(), cache)
            .join(&self.collections)
    }

    /// Validate untrusted `sub_path` and `file_name` and return the absolute
    /// path they name inside the vault.
    pub async fn resolve(&self, sub_path: &str, file_name: &str) -> VaultResult<PathBuf> {
        path_guard::resolve(&self.root, sub_path, file_name).await
    }

    /// Directory of the project called `name`.
    pub async fn project_dir(&self, name: &str) -> VaultResult<PathBuf> {
        let name = path_guard::validate_segment(name, SegmentKind::Name)?;
        let candidate = self.layout.path(Folder::Projects).join(name);
        path_guard::validate_within_root(&candidate, &self.root).await
    }

    /// Start the periodic cache sweep.  Returns `false` if already running
    /// or called outside a tokio runtime.
    pub fn start_maintenance(&self) -> bool {
        self.caches.start(self.sweep_interval)
    }

    pub fn stop_maintenance(&self) -> bool {
        self.caches.stop()
    }
}
