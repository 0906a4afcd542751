//! The standard top-level folders of a vault.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{VaultError, VaultResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Folder {
    Inbox,
    Projects,
    Areas,
    Resources,
    Archive,
    Journal,
    Templates,
    Chat,
}

impl Folder {
    /// Folders a valid vault must have.  `chat/` is created on first use.
    pub const ALL: [Folder; 7] = [
        Folder::Inbox,
        Folder::Projects,
        Folder::Areas,
        Folder::Resources,
        Folder::Archive,
        Folder::Journal,
        Folder::Templates,
    ];

    /// Folders that hold free-standing notes.
    pub const NOTES: [Folder; 5] = [
        Folder::Inbox,
        Folder::Projects,
        Folder::Areas,
        Folder::Resources,
        Folder::Archive,
    ];

    /// Directory name on disk.
    pub fn dir_name(self) -> &'static str {
        match self {
            Folder::Inbox => "0-inbox",
            Folder::Projects => "1-projects",
            Folder::Areas => "2-areas",
            Folder::Resources => "3-resources",
            Folder::Archive => "4-archive",
            Folder::Journal => "journal",
            Folder::Templates => "templates",
            Folder::Chat => "chat",
        }
    }

    /// The folder whose directory is called `name`, if any.
    pub fn from_dir_name(name: &str) -> Option<Folder> {
        Folder::ALL
            .into_iter()
            .chain([Folder::Chat])
            .find(|folder| folder.dir_name() == name)
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutReport {
    pub valid: bool,
    /// Folders that are absent or exist as something other than a directory.
    pub missing: Vec<Folder>,
}

#[derive(Debug, Clone)]
pub struct VaultLayout {
    root: PathBuf,
}

impl VaultLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, folder: Folder) -> PathBuf {
        self.root.join(folder.dir_name())
    }

    pub async fn validate(&self) -> LayoutReport {
        let mut missing = Vec::new();
        for folder in Folder::ALL {
            let is_dir = tokio::fs::metadata(self.path(folder))
                .await
                .is_ok_and(|meta| meta.is_dir());
            if !is_dir {
                missing.push(folder);
            }
        }
        LayoutReport {
            valid: missing.is_empty(),
            missing,
        }
    }

    /// Create every standard folder that does not exist yet.  Returns the
    /// folders this call created.
    pub async fn create(&self) -> VaultResult<Vec<Folder>> {
        let mut created = Vec::new();
        for folder in Folder::ALL {
            let dir = self.path(folder);
            if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                debug!(folder = %folder, "already present");
                continue;
            }
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|err| VaultError::io(&dir, err))?;
            created.push(folder);
        }
        if !created.is_empty() {
            info!(root = %self.root.display(), created = created.len(), "vault layout created");
        }
        Ok(created)
    }
}
