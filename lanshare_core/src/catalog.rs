//! Directory catalog: what the server currently offers.
//!
//! The server owns a [`ServerRoot`] and lists its immediate children fresh on
//! every call. Clients keep the last fetched [`CatalogSnapshot`].

use crate::error::{ShareError, ShareResult};
use crate::transfer::constants::MAX_FILENAME_LENGTH;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Folder,
}

/// An immediate child of the server root.
///
/// On the wire this is `{name, is_folder}`; internally the kind is a tagged
/// variant so new kinds don't need a wire change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "WireEntry", into = "WireEntry")]
pub struct DirectoryEntry {
    pub name: String,
    pub kind: EntryKind,
}

impl DirectoryEntry {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
        }
    }

    pub fn folder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Folder,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }
}

#[derive(Serialize, Deserialize)]
struct WireEntry {
    name: String,
    is_folder: bool,
}

impl From<WireEntry> for DirectoryEntry {
    fn from(w: WireEntry) -> Self {
        let kind = if w.is_folder {
            EntryKind::Folder
        } else {
            EntryKind::File
        };
        Self { name: w.name, kind }
    }
}

impl From<DirectoryEntry> for WireEntry {
    fn from(e: DirectoryEntry) -> Self {
        Self {
            is_folder: e.is_folder(),
            name: e.name,
        }
    }
}

/// Root path plus its entries at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub root: PathBuf,
    pub entries: Vec<DirectoryEntry>,
}

impl CatalogSnapshot {
    pub fn get(&self, name: &str) -> Option<&DirectoryEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn files(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.iter().filter(|e| !e.is_folder())
    }
}

/// Server-side reference to the shared directory.
///
/// Readers take a whole `Arc<PathBuf>` and work from it, so a concurrent
/// [`ServerRoot::select`] is seen entirely before or entirely after.
#[derive(Debug, Clone)]
pub struct ServerRoot {
    current: Arc<RwLock<Arc<PathBuf>>>,
}

impl ServerRoot {
    /// Validate `path` and use it as the initial root.
    pub async fn new(path: impl AsRef<Path>) -> ShareResult<Self> {
        let path = validate_directory(path.as_ref()).await?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(path))),
        })
    }

    /// The present root. Cheap; never waits on I/O.
    pub fn current(&self) -> Arc<PathBuf> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the root if `path` is a readable directory, returning the new
    /// (canonical) path. On failure the old root stays in place.
    pub async fn select(&self, path: impl AsRef<Path>) -> ShareResult<PathBuf> {
        let path = validate_directory(path.as_ref()).await?;
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(path.clone());
        info!("Server root is now {}", path.display());
        Ok(path)
    }

    /// List the immediate children of the current root.
    pub async fn list_entries(&self) -> ShareResult<Vec<DirectoryEntry>> {
        let root = self.current();
        list_directory(&root).await
    }

    /// Current root together with its listing, taken from one root value.
    pub async fn snapshot(&self) -> ShareResult<CatalogSnapshot> {
        let root = self.current();
        let entries = list_directory(&root).await?;
        Ok(CatalogSnapshot {
            root: root.as_ref().clone(),
            entries,
        })
    }
}

async fn validate_directory(path: &Path) -> ShareResult<PathBuf> {
    let unavailable = |reason: String| ShareError::DirectoryUnavailable {
        path: path.to_path_buf(),
        reason,
    };

    let canonical = tokio::fs::canonicalize(path)
        .await
        .map_err(|e| unavailable(e.to_string()))?;
    let metadata = tokio::fs::metadata(&canonical)
        .await
        .map_err(|e| unavailable(e.to_string()))?;
    if !metadata.is_dir() {
        return Err(unavailable("not a directory".to_string()));
    }
    // Opening it proves we may enumerate it
    tokio::fs::read_dir(&canonical)
        .await
        .map_err(|e| unavailable(e.to_string()))?;

    Ok(canonical)
}

/// Non-recursive listing of `dir`, sorted by name.
pub async fn list_directory(dir: &Path) -> ShareResult<Vec<DirectoryEntry>> {
    let mut read_dir =
        tokio::fs::read_dir(dir)
            .await
            .map_err(|e| ShareError::DirectoryUnavailable {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })?;

    let mut entries = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                warn!("Skipping entry with non UTF-8 name: {:?}", raw);
                continue;
            }
        };
        // Could never be requested, and must fit one catalog frame
        if name.len() > MAX_FILENAME_LENGTH {
            warn!("Skipping entry with overlong name ({} bytes)", name.len());
            continue;
        }

        // Follow symlinks so a link to a folder is listed as a folder
        let is_dir = match tokio::fs::metadata(entry.path()).await {
            Ok(meta) => meta.is_dir(),
            Err(_) => match entry.file_type().await {
                Ok(ft) => ft.is_dir(),
                Err(e) => {
                    debug!("Skipping {}: {}", name, e);
                    continue;
                }
            },
        };

        entries.push(if is_dir {
            DirectoryEntry::folder(name)
        } else {
            DirectoryEntry::file(name)
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_wire_form_is_boolean_flag() {
        let json = serde_json::to_string(&DirectoryEntry::folder("docs")).unwrap();
        assert_eq!(json, r#"{"name":"docs","is_folder":true}"#);

        let parsed: DirectoryEntry =
            serde_json::from_str(r#"{"name":"readme.txt","is_folder":false}"#).unwrap();
        assert_eq!(parsed, DirectoryEntry::file("readme.txt"));
    }

    #[tokio::test]
    async fn test_list_is_shallow_and_tagged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs").join("nested.txt"), b"deep").unwrap();

        let entries = list_directory(dir.path()).await.unwrap();
        assert_eq!(
            entries,
            vec![DirectoryEntry::folder("docs"), DirectoryEntry::file("readme.txt")]
        );
    }

    #[tokio::test]
    async fn test_select_missing_keeps_old_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = ServerRoot::new(dir.path()).await.unwrap();
        let before = root.current();

        let err = root.select(dir.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, ShareError::DirectoryUnavailable { .. }));
        assert_eq!(root.current(), before);
    }

    #[tokio::test]
    async fn test_select_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, b"x").unwrap();

        let root = ServerRoot::new(dir.path()).await.unwrap();
        let err = root.select(&file).await.unwrap_err();
        assert!(matches!(err, ShareError::DirectoryUnavailable { .. }));
    }
}
