//! Cached, folder-scoped sets of documents.
//!
//! A [`DocumentCollection`] answers `list()` from its cache when it can and
//! rescans its folders otherwise.  Every mutation invalidates the
//! collection's keys, and those of every member of its [`CollectionSet`]
//! covering a folder it touched, before returning.  The TTL only bounds
//! staleness caused by edits made outside the engine.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cache::Cache;
use crate::error::{VaultError, VaultResult};
use crate::frontmatter::Document;
use crate::layout::Folder;
use crate::path_guard::{self, SegmentKind};
use crate::store::DocumentStore;

const MARKDOWN_EXT: &str = "md";

/// A document together with where it lives.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    /// Path relative to the vault root, always `/`-separated.
    pub rel_path: String,
    pub document: Document,
    pub modified: DateTime<Utc>,
}

pub type Listing = Arc<Vec<StoredDocument>>;

#[derive(Debug, Clone)]
struct Member {
    name: String,
    folders: Vec<Folder>,
    cache: Arc<Cache<Listing>>,
}

/// The collections opened on one vault.
///
/// Collections may overlap (notes and projects both cover `1-projects`) and a
/// move can carry a document into a folder another collection owns, so
/// invalidation goes through the set rather than a single cache.
#[derive(Debug, Clone, Default)]
pub struct CollectionSet {
    members: Arc<Mutex<Vec<Member>>>,
}

impl CollectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn members(&self) -> MutexGuard<'_, Vec<Member>> {
        self.members
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, name: &str, folders: &[Folder], cache: &Arc<Cache<Listing>>) {
        self.members().push(Member {
            name: name.to_string(),
            folders: folders.to_vec(),
            cache: Arc::clone(cache),
        });
    }

    pub fn len(&self) -> usize {
        self.members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the cached entries of every member covering one of `touched`.
    pub fn invalidate(&self, touched: &[Folder]) -> usize {
        let affected: Vec<Member> = self
            .members()
            .iter()
            .filter(|member| member.folders.iter().any(|f| touched.contains(f)))
            .cloned()
            .collect();
        affected
            .iter()
            .map(|member| member.cache.delete_pattern(&format!("{}:*", member.name)))
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct DocumentCollection {
    name: String,
    root: PathBuf,
    folders: Vec<Folder>,
    store: DocumentStore,
    cache: Arc<Cache<Listing>>,
    set: CollectionSet,
}

impl DocumentCollection {
    /// `root` must already be normalized; `cache` is keyed `"<name>:…"`.
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        folders: &[Folder],
        store: DocumentStore,
        cache: Arc<Cache<Listing>>,
    ) -> Self {
        let name = name.into();
        let set = CollectionSet::new();
        set.add(&name, folders, &cache);
        Self {
            name,
            root: root.into(),
            folders: folders.to_vec(),
            store,
            cache,
            set,
        }
    }

    /// Move this collection into `set`.  From then on its mutations
    /// invalidate the other members, and theirs invalidate it.
    pub fn join(mut self, set: &CollectionSet) -> Self {
        set.add(&self.name, &self.folders, &self.cache);
        self.set = set.clone();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn folders(&self) -> &[Folder] {
        &self.folders
    }

    fn list_key(&self) -> String {
        format!("{}:all", self.name)
    }

    /// Drop every cached entry of this collection and of each set member
    /// sharing a folder with it.
    pub fn invalidate(&self) -> usize {
        self.invalidate_folders(&self.folders)
    }

    fn invalidate_folders(&self, touched: &[Folder]) -> usize {
        let own = self.cache.delete_pattern(&format!("{}:*", self.name));
        own + self.set.invalidate(touched)
    }

    /// Standard folders the given absolute paths live in.
    fn folders_of(&self, paths: &[&Path]) -> Vec<Folder> {
        paths
            .iter()
            .filter_map(|path| {
                let top = path.strip_prefix(&self.root).ok()?.components().next()?;
                Folder::from_dir_name(&top.as_os_str().to_string_lossy())
            })
            .collect()
    }

    /// Every parseable document in the collection, sorted by path.
    pub async fn list(&self) -> VaultResult<Listing> {
        let key = self.list_key();
        if let Some(hit) = self.cache.get(&key) {
            debug!(collection = %self.name, "list served from cache");
            return Ok(hit);
        }

        let listing: Listing = Arc::new(self.scan().await?);
        self.cache.set(key, Arc::clone(&listing));
        Ok(listing)
    }

    async fn scan(&self) -> VaultResult<Vec<StoredDocument>> {
        let dirs: Vec<PathBuf> = self
            .folders
            .iter()
            .map(|folder| self.root.join(folder.dir_name()))
            .collect();
        let paths = tokio::task::spawn_blocking(move || find_markdown(&dirs))
            .await
            .map_err(|err| VaultError::io(&self.root, io::Error::other(err)))?;

        let mut docs = Vec::with_capacity(paths.len());
        for path in paths {
            match self.load(&path).await {
                Ok(doc) => docs.push(doc),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable document");
                }
            }
        }
        docs.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        debug!(collection = %self.name, count = docs.len(), "scanned");
        Ok(docs)
    }

    async fn load(&self, path: &Path) -> VaultResult<StoredDocument> {
        let document = self.store.load_document(path).await?;
        let modified = self.store.modified_time(path).await?;
        Ok(StoredDocument {
            rel_path: rel_string(&self.root, path),
            document,
            modified,
        })
    }

    /// Resolve `rel_path` (`<folder>/…/<file>`) to an absolute path inside
    /// one of this collection's folders.
    async fn resolve(&self, rel_path: &str) -> VaultResult<PathBuf> {
        let rel_path = rel_path.trim();
        let Some((dir, file)) = rel_path.rsplit_once('/') else {
            return Err(VaultError::invalid_path(format!(
                "document path must start with a folder of the {} collection",
                self.name
            )));
        };
        let dir = path_guard::validate_segment(dir, SegmentKind::SubPath)?;
        let top = dir.split('/').next().unwrap_or_default();
        if !self.folders.iter().any(|f| f.dir_name() == top) {
            return Err(VaultError::invalid_path(format!(
                "{dir} is outside the {} collection",
                self.name
            )));
        }
        path_guard::resolve(&self.root, &dir, file).await
    }

    pub async fn get(&self, rel_path: &str) -> VaultResult<StoredDocument> {
        let path = self.resolve(rel_path).await?;
        self.load(&path).await
    }

    /// Write a new document at `<dir>/<file_name>`.  Fails if one exists.
    pub async fn create(
        &self,
        dir: &str,
        file_name: &str,
        doc: &Document,
    ) -> VaultResult<StoredDocument> {
        let file_name = path_guard::validate_file_name(file_name)?;
        let path = self.resolve(&format!("{}/{file_name}", dir.trim())).await?;
        if self.store.exists(&path).await {
            return Err(already_exists(&path));
        }

        let result = self.store.save_document(&path, doc).await;
        self.invalidate_folders(&self.folders_of(&[path.as_path()]));
        result?;
        self.load(&path).await
    }

    /// Apply `edit` to the stored document under its file lock.
    pub async fn update<F>(&self, rel_path: &str, edit: F) -> VaultResult<StoredDocument>
    where
        F: FnOnce(&mut Document),
    {
        let path = self.resolve(rel_path).await?;
        let result = self.store.update_document(&path, edit).await;
        self.invalidate_folders(&self.folders_of(&[path.as_path()]));
        let document = result?;
        Ok(StoredDocument {
            rel_path: rel_string(&self.root, &path),
            document,
            modified: self.store.modified_time(&path).await?,
        })
    }

    /// Move a document to `dest_dir` (any folder inside the vault), keeping
    /// its file name.  Returns the new relative path.  Collections covering
    /// either end of the move are invalidated.
    pub async fn move_to(&self, rel_path: &str, dest_dir: &str) -> VaultResult<String> {
        let src = self.resolve(rel_path).await?;
        let file_name = src
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dst = path_guard::resolve(&self.root, dest_dir, &file_name).await?;
        if self.store.exists(&dst).await {
            return Err(already_exists(&dst));
        }

        let result = self.store.move_file(&src, &dst).await;
        self.invalidate_folders(&self.folders_of(&[src.as_path(), dst.as_path()]));
        result?;
        Ok(rel_string(&self.root, &dst))
    }

    pub async fn delete(&self, rel_path: &str) -> VaultResult<()> {
        let path = self.resolve(rel_path).await?;
        let result = self.store.delete(&path).await;
        self.invalidate_folders(&self.folders_of(&[path.as_path()]));
        result
    }
}

fn already_exists(path: &Path) -> VaultError {
    VaultError::io(
        path,
        io::Error::new(io::ErrorKind::AlreadyExists, "document already exists"),
    )
}

fn rel_string(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Visible `.md` files under each of `dirs`.  Missing folders are skipped.
fn find_markdown(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for dir in dirs {
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker {
            match entry {
                Ok(entry) => {
                    let is_md = entry
                        .path()
                        .extension()
                        .is_some_and(|ext| ext == MARKDOWN_EXT);
                    if entry.file_type().is_file() && is_md {
                        found.push(entry.into_path());
                    }
                }
                Err(err) if err.io_error().is_some_and(|e| e.kind() == io::ErrorKind::NotFound) => {
                    debug!(dir = %dir.display(), "folder missing, nothing to scan");
                }
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "scan error");
                }
            }
        }
    }
    found
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOptions;
    use std::time::Duration;
    use tempfile::TempDir;

    fn collection(root: &Path, name: &str, folders: &[Folder]) -> DocumentCollection {
        let cache = Arc::new(Cache::new(
            name,
            CacheOptions {
                ttl: Duration::from_secs(300),
                max_size: 10,
            },
        ));
        DocumentCollection::new(name, root, folders, DocumentStore::default(), cache)
    }

    fn doc(id: &str, body: &str) -> Document {
        let mut d = Document::new(Default::default(), body);
        d.set("id", id);
        d
    }

    #[tokio::test]
    async fn list_scans_only_its_folders_and_skips_junk() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let write = |rel: &str, text: &str| {
            let p = root.join(rel);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(p, text).unwrap();
        };
        write("0-inbox/a.md", "---\nid: a\n---\n\nA");
        write("2-areas/health/b.md", "B only");
        write("2-areas/.obsidian/c.md", "hidden");
        write("2-areas/d.txt", "not markdown");
        write("2-areas/broken.md", "---\nid: [x\n---\n");
        write("journal/2024-01-01.md", "other collection");

        let notes = collection(root, "notes", &[Folder::Inbox, Folder::Areas]);
        let listing = notes.list().await.unwrap();
        let paths: Vec<&str> = listing.iter().map(|d| d.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["0-inbox/a.md", "2-areas/health/b.md"]);
        assert_eq!(listing[0].document.get_str("id"), Some("a"));
    }

    #[tokio::test]
    async fn list_is_cached_until_a_mutation() {
        let dir = TempDir::new().unwrap();
        let notes = collection(dir.path(), "notes", &[Folder::Inbox]);
        notes.create("0-inbox", "one.md", &doc("1", "first")).await.unwrap();
        assert_eq!(notes.list().await.unwrap().len(), 1);

        // Out-of-band edits are invisible while the entry is live.
        std::fs::write(dir.path().join("0-inbox/two.md"), "sneaky").unwrap();
        assert_eq!(notes.list().await.unwrap().len(), 1);

        notes.create("0-inbox", "three.md", &doc("3", "third")).await.unwrap();
        assert_eq!(notes.list().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn create_get_update_round_trip() {
        let dir = TempDir::new().unwrap();
        let projects = collection(dir.path(), "projects", &[Folder::Projects]);

        let created = projects
            .create("1-projects/project-alpha/notes", "x.md", &doc("1", "hello"))
            .await
            .unwrap();
        assert_eq!(created.rel_path, "1-projects/project-alpha/notes/x.md");

        let fetched = projects.get("1-projects/project-alpha/notes/x.md").await.unwrap();
        assert_eq!(fetched.document, doc("1", "hello"));

        let updated = projects
            .update("1-projects/project-alpha/notes/x.md", |d| d.set("status", "done"))
            .await
            .unwrap();
        assert_eq!(updated.document.get_str("status"), Some("done"));
        assert_eq!(updated.document.body, "hello");
    }

    #[tokio::test]
    async fn create_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let notes = collection(dir.path(), "notes", &[Folder::Inbox]);
        notes.create("0-inbox", "a.md", &doc("1", "x")).await.unwrap();
        let err = notes.create("0-inbox", "a.md", &doc("2", "y")).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn paths_outside_the_collection_are_rejected() {
        let dir = TempDir::new().unwrap();
        let journals = collection(dir.path(), "journal", &[Folder::Journal]);

        for rel in ["0-inbox/a.md", "a.md", "journal/../0-inbox/a.md", "/etc/passwd"] {
            assert!(
                matches!(journals.get(rel).await, Err(VaultError::InvalidPath { .. })),
                "{rel} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn move_and_delete_invalidate() {
        let dir = TempDir::new().unwrap();
        let set = CollectionSet::new();
        let notes = collection(dir.path(), "notes", &[Folder::Inbox, Folder::Archive]).join(&set);
        let projects = collection(dir.path(), "projects", &[Folder::Projects]).join(&set);

        notes.create("0-inbox", "idea.md", &doc("1", "idea")).await.unwrap();
        projects.list().await.unwrap();
        assert_eq!(notes.list().await.unwrap().len(), 1);

        let moved = notes.move_to("0-inbox/idea.md", "4-archive/2024").await.unwrap();
        assert_eq!(moved, "4-archive/2024/idea.md");
        // Projects covers neither end of the move.
        assert_eq!(projects.cache.keys(), vec!["projects:all".to_string()]);

        let listing = notes.list().await.unwrap();
        assert_eq!(listing[0].rel_path, "4-archive/2024/idea.md");

        notes.delete(&moved).await.unwrap();
        assert!(notes.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn move_into_another_collection_refreshes_its_listing() {
        let dir = TempDir::new().unwrap();
        let set = CollectionSet::new();
        let notes = collection(dir.path(), "notes", &[Folder::Inbox]).join(&set);
        let journals = collection(dir.path(), "journals", &[Folder::Journal]).join(&set);
        assert_eq!(set.len(), 2);

        notes.create("0-inbox", "2024-01-01.md", &doc("1", "day")).await.unwrap();
        assert!(journals.list().await.unwrap().is_empty());

        let moved = notes.move_to("0-inbox/2024-01-01.md", "journal").await.unwrap();
        assert_eq!(moved, "journal/2024-01-01.md");

        let listing = journals.list().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].rel_path, "journal/2024-01-01.md");
        assert!(notes.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overlapping_members_see_each_others_writes() {
        let dir = TempDir::new().unwrap();
        let set = CollectionSet::new();
        let notes = collection(dir.path(), "notes", &[Folder::Inbox, Folder::Projects]).join(&set);
        let projects = collection(dir.path(), "projects", &[Folder::Projects]).join(&set);
        let journals = collection(dir.path(), "journals", &[Folder::Journal]).join(&set);

        assert!(notes.list().await.unwrap().is_empty());
        journals.list().await.unwrap();
        projects
            .create("1-projects/alpha", "plan.md", &doc("p1", "plan"))
            .await
            .unwrap();

        assert_eq!(notes.list().await.unwrap().len(), 1);
        // Untouched folders keep their cached listing.
        assert!(journals.cache.has("journals:all"));
    }

    #[test]
    fn rel_string_uses_forward_slashes() {
        assert_eq!(
            rel_string(Path::new("/v"), Path::new("/v/1-projects/a/x.md")),
            "1-projects/a/x.md"
        );
    }
}
