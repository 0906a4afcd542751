//! File I/O for vault documents.
//!
//! Every mutation goes through the [`LockManager`]; reads and existence checks
//! do not.  Writes land in a hidden sibling `.<name>.tmp` first and are
//! renamed over the target, so a reader never sees a half-written document.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{VaultError, VaultResult};
use crate::frontmatter::Document;
use crate::lock::LockManager;

/// Filters for [`DocumentStore::list_files`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub recursive: bool,
    /// Keep only files with this extension (`"md"` or `".md"`).
    pub extension: Option<String>,
}

impl ListOptions {
    pub fn markdown() -> Self {
        Self {
            recursive: false,
            extension: Some("md".to_string()),
        }
    }

    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    fn accepts(&self, path: &Path) -> bool {
        let Some(wanted) = self.extension.as_deref() else {
            return true;
        };
        let wanted = wanted.trim_start_matches('.');
        path.extension().is_some_and(|ext| ext == wanted)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DocumentStore {
    locks: LockManager,
}

impl DocumentStore {
    pub fn new(locks: LockManager) -> Self {
        Self { locks }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub async fn read(&self, path: &Path) -> VaultResult<String> {
        debug!(path = %path.display(), "read");
        tokio::fs::read_to_string(path)
            .await
            .map_err(|err| VaultError::io(path, err))
    }

    /// Replace `path` with `content`, creating parent directories as needed.
    pub async fn write(&self, path: &Path, content: &str) -> VaultResult<()> {
        if let Some(parent) = path.parent() {
            self.ensure_dir(parent).await?;
        }
        self.locks
            .with_lock(path, move || async move {
                write_atomic(path, content).await?;
                debug!(path = %path.display(), bytes = content.len(), "wrote");
                Ok(())
            })
            .await
    }

    /// Rename `src` to `dst`.  Holds the lock on `src` only.
    pub async fn move_file(&self, src: &Path, dst: &Path) -> VaultResult<()> {
        if let Some(parent) = dst.parent() {
            self.ensure_dir(parent).await?;
        }
        self.locks
            .with_lock(src, move || async move {
                tokio::fs::rename(src, dst)
                    .await
                    .map_err(|err| VaultError::io(src, err))?;
                debug!(from = %src.display(), to = %dst.display(), "moved");
                Ok(())
            })
            .await
    }

    /// Copy `src` to `dst`.  Holds the lock on `dst` only.
    pub async fn copy(&self, src: &Path, dst: &Path) -> VaultResult<()> {
        if let Some(parent) = dst.parent() {
            self.ensure_dir(parent).await?;
        }
        self.locks
            .with_lock(dst, move || async move {
                tokio::fs::copy(src, dst)
                    .await
                    .map_err(|err| VaultError::io(src, err))?;
                debug!(from = %src.display(), to = %dst.display(), "copied");
                Ok(())
            })
            .await
    }

    pub async fn delete(&self, path: &Path) -> VaultResult<()> {
        self.locks
            .with_lock(path, move || async move {
                tokio::fs::remove_file(path)
                    .await
                    .map_err(|err| VaultError::io(path, err))?;
                debug!(path = %path.display(), "deleted");
                Ok(())
            })
            .await
    }

    /// Advisory only; the answer may be stale by the time it is used.
    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    pub async fn ensure_dir(&self, dir: &Path) -> VaultResult<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|err| VaultError::io(dir, err))
    }

    /// Files under `dir`, sorted.  Hidden entries (leading `.`) are skipped,
    /// which also excludes in-flight temp files.  A missing directory yields
    /// an empty list.
    pub async fn list_files(&self, dir: &Path, opts: &ListOptions) -> VaultResult<Vec<PathBuf>> {
        let root = dir.to_path_buf();
        let opts = opts.clone();
        tokio::task::spawn_blocking(move || walk_files(&root, &opts))
            .await
            .map_err(|err| VaultError::io(dir, io::Error::other(err)))?
    }

    /// Names of the immediate, non-hidden subdirectories of `dir`, sorted.
    pub async fn list_directories(&self, dir: &Path) -> VaultResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(VaultError::io(dir, err)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| VaultError::io(dir, err))?
        {
            let name = entry.file_name();
            if is_hidden(&name) {
                continue;
            }
            let is_dir = entry
                .file_type()
                .await
                .map_err(|err| VaultError::io(entry.path(), err))?
                .is_dir();
            if is_dir {
                names.push(name.to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn modified_time(&self, path: &Path) -> VaultResult<DateTime<Utc>> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|err| VaultError::io(path, err))?;
        let mtime = meta.modified().map_err(|err| VaultError::io(path, err))?;
        Ok(DateTime::<Utc>::from(mtime))
    }

    pub async fn load_document(&self, path: &Path) -> VaultResult<Document> {
        let text = self.read(path).await?;
        Ok(Document::parse(&text)?)
    }

    pub async fn save_document(&self, path: &Path, doc: &Document) -> VaultResult<()> {
        let text = doc.to_text()?;
        self.write(path, &text).await
    }

    /// Read, edit and rewrite a document under a single lock, so concurrent
    /// edits to one file cannot overwrite each other.
    pub async fn update_document<F>(&self, path: &Path, edit: F) -> VaultResult<Document>
    where
        F: FnOnce(&mut Document),
    {
        self.locks
            .with_lock(path, move || async move {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|err| VaultError::io(path, err))?;
                let mut doc = Document::parse(&text)?;
                edit(&mut doc);
                write_atomic(path, &doc.to_text()?).await?;
                debug!(path = %path.display(), "updated");
                Ok(doc)
            })
            .await
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

fn walk_files(dir: &Path, opts: &ListOptions) -> VaultResult<Vec<PathBuf>> {
    let mut walker = WalkDir::new(dir).min_depth(1).follow_links(false);
    if !opts.recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    // The root itself may be hidden (a temp dir, say); only its contents are filtered.
    for entry in walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err)
                if err.depth() == 0
                    && err.io_error().is_some_and(|e| e.kind() == io::ErrorKind::NotFound) =>
            {
                return Ok(Vec::new());
            }
            Err(err) => {
                let path = err.path().unwrap_or(dir).to_path_buf();
                return Err(VaultError::io(path, err.into()));
            }
        };
        if entry.file_type().is_file() && opts.accepts(entry.path()) {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

fn tmp_path(path: &Path) -> PathBuf {
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    path.with_file_name(format!(".{filename}.tmp"))
}

async fn write_atomic(path: &Path, content: &str) -> VaultResult<()> {
    let tmp = tmp_path(path);

    let written: io::Result<()> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(VaultError::io(&tmp, err));
    }

    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(VaultError::io(path, err));
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LockError;
    use crate::lock::LockOptions;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store() -> DocumentStore {
        DocumentStore::default()
    }

    #[tokio::test]
    async fn write_creates_parents_and_reads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1-projects/alpha/notes/x.md");
        let s = store();

        s.write(&path, "hello").await.unwrap();
        assert_eq!(s.read(&path).await.unwrap(), "hello");
        // Neither the temp file nor the lock marker is left behind.
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("x.md")]);
    }

    #[tokio::test]
    async fn write_replaces_existing_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.md");
        let s = store();
        s.write(&path, "first version, longer").await.unwrap();
        s.write(&path, "second").await.unwrap();
        assert_eq!(s.read(&path).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn read_missing_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope.md");
        let err = store().read(&path).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("nope.md"));
    }

    #[tokio::test]
    async fn concurrent_writes_leave_one_whole_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contended.md");
        let s = store();
        let a = "A".repeat(64 * 1024);
        let b = "B".repeat(64 * 1024);

        let (ra, rb) = tokio::join!(s.write(&path, &a), s.write(&path, &b));
        ra.unwrap();
        rb.unwrap();

        let content = s.read(&path).await.unwrap();
        assert!(content == a || content == b);
    }

    #[tokio::test]
    async fn write_fails_fast_when_lock_is_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("held.md");
        let locks = LockManager::new(LockOptions {
            timeout: Duration::from_millis(100),
            retries: 1,
            min_backoff: Duration::from_millis(10),
            ..LockOptions::default()
        });
        let s = DocumentStore::new(locks.clone());

        let _guard = locks.acquire(&path).await.unwrap();
        let err = s.write(&path, "x").await.unwrap_err();
        assert!(matches!(err, VaultError::Lock(LockError::Held { .. })));
        assert!(!s.exists(&path).await);
    }

    #[tokio::test]
    async fn move_creates_destination_parent() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("0-inbox/idea.md");
        let dst = dir.path().join("4-archive/2024/idea.md");
        let s = store();

        s.write(&src, "idea").await.unwrap();
        s.move_file(&src, &dst).await.unwrap();
        assert!(!s.exists(&src).await);
        assert_eq!(s.read(&dst).await.unwrap(), "idea");
    }

    #[tokio::test]
    async fn copy_keeps_source() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("templates/daily.md");
        let dst = dir.path().join("journal/2024-01-01.md");
        let s = store();

        s.write(&src, "# Daily").await.unwrap();
        s.copy(&src, &dst).await.unwrap();
        assert_eq!(s.read(&src).await.unwrap(), "# Daily");
        assert_eq!(s.read(&dst).await.unwrap(), "# Daily");
    }

    #[tokio::test]
    async fn delete_removes_and_missing_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.md");
        let s = store();

        s.write(&path, "x").await.unwrap();
        s.delete(&path).await.unwrap();
        assert!(!s.exists(&path).await);
        assert!(s.delete(&path).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_files_filters_and_recurses() {
        let dir = TempDir::new().unwrap();
        let s = store();
        for rel in ["a.md", "b.txt", "sub/c.md", "sub/deeper/d.md", ".hidden.md", ".obsidian/e.md"] {
            s.write(&dir.path().join(rel), "x").await.unwrap();
        }

        let flat = s.list_files(dir.path(), &ListOptions::markdown()).await.unwrap();
        assert_eq!(flat, vec![dir.path().join("a.md")]);

        let deep = s
            .list_files(dir.path(), &ListOptions::markdown().recursive())
            .await
            .unwrap();
        assert_eq!(
            deep,
            vec![
                dir.path().join("a.md"),
                dir.path().join("sub/c.md"),
                dir.path().join("sub/deeper/d.md"),
            ]
        );

        let everything = s
            .list_files(dir.path(), &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(everything.len(), 2);
    }

    #[tokio::test]
    async fn list_files_skips_hidden_dirs_below_a_hidden_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join(".vault");
        let s = store();
        for rel in ["keep.md", "nested/keep.md", ".trash/gone.md", "nested/.cache/gone.md"] {
            s.write(&root.join(rel), "x").await.unwrap();
        }

        let found = s
            .list_files(&root, &ListOptions::markdown().recursive())
            .await
            .unwrap();
        assert_eq!(found, vec![root.join("keep.md"), root.join("nested/keep.md")]);
    }

    #[tokio::test]
    async fn list_on_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        let s = store();
        assert!(s.list_files(&missing, &ListOptions::default()).await.unwrap().is_empty());
        assert!(s.list_directories(&missing).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_directories_names_only() {
        let dir = TempDir::new().unwrap();
        let s = store();
        for sub in ["beta", "alpha", ".git"] {
            s.ensure_dir(&dir.path().join(sub)).await.unwrap();
        }
        s.write(&dir.path().join("file.md"), "x").await.unwrap();
        assert_eq!(s.list_directories(dir.path()).await.unwrap(), vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn modified_time_is_recent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.md");
        let s = store();
        s.write(&path, "x").await.unwrap();
        let mtime = s.modified_time(&path).await.unwrap();
        let age = Utc::now() - mtime;
        assert!(age.num_seconds().abs() < 60);
    }

    #[tokio::test]
    async fn document_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.md");
        let s = store();

        let mut doc = Document::default();
        doc.set("id", "1");
        doc.body = "hello".to_string();
        s.save_document(&path, &doc).await.unwrap();

        let loaded = s.load_document(&path).await.unwrap();
        assert_eq!(loaded, doc);
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counter.md");
        let s = DocumentStore::new(LockManager::new(LockOptions {
            retries: 100,
            timeout: Duration::from_secs(30),
            min_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            ..LockOptions::default()
        }));
        let mut doc = Document::default();
        doc.set("count", 0);
        s.save_document(&path, &doc).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let s = s.clone();
            let path = path.clone();
            tasks.push(tokio::spawn(async move {
                s.update_document(&path, |doc| {
                    let n = doc.get("count").and_then(|v| v.as_u64()).unwrap_or(0);
                    doc.set("count", n + 1);
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let doc = s.load_document(&path).await.unwrap();
        assert_eq!(doc.get("count").and_then(|v| v.as_u64()), Some(10));
    }

    #[tokio::test]
    async fn load_document_surfaces_codec_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.md");
        std::fs::write(&path, "---\ntitle: x\n").unwrap();
        let err = store().load_document(&path).await.unwrap_err();
        assert!(matches!(err, VaultError::Codec(_)));
    }
}
