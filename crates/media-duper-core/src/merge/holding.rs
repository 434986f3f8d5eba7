use super::fsops;
use crate::error::Error;
use crate::model::{FileId, GroupId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";
const LOCKS_DIR: &str = ".locks";
const PARTIAL_SUFFIX: &str = ".partial";

/// Where one removal candidate lives before and after staging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedEntry {
    pub file_id: FileId,
    pub original_path: PathBuf,
    pub staged_path: PathBuf,
    pub size: u64,
    pub digest: String,
}

/// Written before any file is touched, so an interrupted transaction can be
/// reversed from the holding area alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingManifest {
    pub transaction_id: String,
    pub group_id: GroupId,
    pub keeper_id: FileId,
    pub keeper_path: PathBuf,
    /// Keeper sidecar content before the merge; `None` if there was none.
    pub metadata_before: Option<String>,
    pub entries: Vec<StagedEntry>,
    pub created_at: DateTime<Utc>,
}

/// Per-transaction subdirectories holding staged removals.
///
/// ```text
/// <root>/<transaction-id>/manifest.json
/// <root>/<transaction-id>/files/0000-<name>
/// <root>/.locks/group-<id>.lock
/// ```
#[derive(Debug, Clone)]
pub struct HoldingArea {
    root: PathBuf,
}

impl HoldingArea {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        fs::create_dir_all(root.join(LOCKS_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.root.join(LOCKS_DIR)
    }

    pub fn transaction_dir(&self, transaction_id: &str) -> PathBuf {
        self.root.join(transaction_id)
    }

    pub fn staged_path(&self, transaction_id: &str, index: usize, original: &Path) -> PathBuf {
        let name = original
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        self.transaction_dir(transaction_id)
            .join(FILES_DIR)
            .join(format!("{:04}-{}", index, name))
    }

    pub fn exists(&self, transaction_id: &str) -> bool {
        self.transaction_dir(transaction_id).is_dir()
    }

    /// Durably writes the manifest, then publishes the transaction directory
    /// with a rename. A listed transaction therefore always has a manifest.
    pub fn begin(&self, manifest: &HoldingManifest) -> Result<PathBuf, Error> {
        let dir = self.transaction_dir(&manifest.transaction_id);
        if dir.exists() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("transaction {} already exists", manifest.transaction_id),
            )));
        }
        let partial = self.partial_dir(&manifest.transaction_id);
        fs::create_dir(&partial)?;
        let published = prepare(&partial, manifest)
            .and_then(|()| fs::rename(&partial, &dir).map_err(Error::from));
        if let Err(e) = published {
            if let Err(cleanup) = fs::remove_dir_all(&partial) {
                debug!("Could not remove {}: {}", partial.display(), cleanup);
            }
            return Err(e);
        }
        fsops::fsync_dir(&self.root)?;
        debug!(
            transaction_id = %manifest.transaction_id,
            "Holding area prepared at {}",
            dir.display()
        );
        Ok(dir)
    }

    /// Removes directories of transactions that never finished `begin`.
    /// Nothing was staged into them. Returns how many were removed.
    pub fn clear_partial(&self) -> Result<usize, Error> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let partial = name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX);
            if partial && entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            fsops::fsync_dir(&self.root)?;
        }
        Ok(removed)
    }

    fn partial_dir(&self, transaction_id: &str) -> PathBuf {
        self.root.join(format!(".{}{}", transaction_id, PARTIAL_SUFFIX))
    }

    pub fn read_manifest(&self, transaction_id: &str) -> Result<Option<HoldingManifest>, Error> {
        match fs::read(self.transaction_dir(transaction_id).join(MANIFEST_FILE)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of files still staged for a transaction.
    pub fn staged_count(&self, transaction_id: &str) -> Result<usize, Error> {
        match fs::read_dir(self.transaction_dir(transaction_id).join(FILES_DIR)) {
            Ok(entries) => Ok(entries.count()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove(&self, transaction_id: &str) -> Result<(), Error> {
        match fs::remove_dir_all(self.transaction_dir(transaction_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fsops::fsync_dir(&self.root)?;
        Ok(())
    }

    /// Transaction ids that currently have a subdirectory, sorted.
    pub fn list_transactions(&self) -> Result<Vec<String>, Error> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn prepare(partial: &Path, manifest: &HoldingManifest) -> Result<(), Error> {
    let bytes = serde_json::to_vec_pretty(manifest)?;
    fsops::write_atomic(&partial.join(MANIFEST_FILE), &bytes)?;
    fs::create_dir(partial.join(FILES_DIR))?;
    fsops::fsync_dir(partial)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(id: &str) -> HoldingManifest {
        HoldingManifest {
            transaction_id: id.to_string(),
            group_id: 7,
            keeper_id: 1,
            keeper_path: PathBuf::from("/photos/keep.jpg"),
            metadata_before: None,
            entries: vec![StagedEntry {
                file_id: 2,
                original_path: PathBuf::from("/photos/dupe.jpg"),
                staged_path: PathBuf::from("/holding/x/files/0000-dupe.jpg"),
                size: 10,
                digest: "abc".to_string(),
            }],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_begin_writes_manifest_and_lists_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let holding = HoldingArea::open(dir.path()).unwrap();
        holding.begin(&manifest("tx-1")).unwrap();

        assert_eq!(holding.list_transactions().unwrap(), vec!["tx-1".to_string()]);
        let read = holding.read_manifest("tx-1").unwrap().unwrap();
        assert_eq!(read.group_id, 7);
        assert_eq!(read.entries, manifest("tx-1").entries);
        assert_eq!(holding.read_manifest("tx-2").unwrap(), None);
        assert_eq!(holding.staged_count("tx-1").unwrap(), 0);

        holding.remove("tx-1").unwrap();
        assert!(!holding.exists("tx-1"));
        assert!(holding.list_transactions().unwrap().is_empty());
    }

    #[test]
    fn test_unfinished_begin_is_hidden_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let holding = HoldingArea::open(dir.path()).unwrap();
        fs::create_dir(holding.partial_dir("tx-9")).unwrap();

        assert!(holding.list_transactions().unwrap().is_empty());
        assert_eq!(holding.clear_partial().unwrap(), 1);
        assert!(!holding.partial_dir("tx-9").exists());
        assert!(holding.root().join(LOCKS_DIR).is_dir());
    }

    #[test]
    fn test_begin_refuses_existing_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let holding = HoldingArea::open(dir.path()).unwrap();
        holding.begin(&manifest("tx-1")).unwrap();
        assert!(holding.begin(&manifest("tx-1")).is_err());
    }

    #[test]
    fn test_staged_path_is_indexed() {
        let holding = HoldingArea {
            root: PathBuf::from("/h"),
        };
        let path = holding.staged_path("tx", 3, Path::new("/a/b/IMG_1.jpg"));
        assert_eq!(path, PathBuf::from("/h/tx/files/0003-IMG_1.jpg"));
    }
}
