use super::fsops;
use crate::error::Error;
use crate::model::{FileId, MediaMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Where merged keeper metadata is written.
pub trait MetadataStore: Send + Sync {
    /// Raw stored metadata for `media`, used as the rollback snapshot.
    fn snapshot(&self, media: &Path) -> Result<Option<String>, Error>;

    fn write(
        &self,
        media: &Path,
        metadata: &MediaMetadata,
        transaction_id: &str,
        merged_from: &[FileId],
    ) -> Result<(), Error>;

    /// Puts back a snapshot taken earlier; `None` removes any stored metadata.
    fn restore(&self, media: &Path, snapshot: Option<&str>) -> Result<(), Error>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarDocument {
    pub metadata: MediaMetadata,
    pub transaction_id: String,
    pub merged_from: Vec<FileId>,
    pub written_at: DateTime<Utc>,
}

/// Stores metadata as `<file>.mdmeta.json` next to the media file.
#[derive(Debug, Clone, Copy, Default)]
pub struct SidecarStore;

impl SidecarStore {
    pub fn sidecar_path(media: &Path) -> PathBuf {
        let mut name = media
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".mdmeta.json");
        media.with_file_name(name)
    }

    pub fn load(&self, media: &Path) -> Result<Option<SidecarDocument>, Error> {
        match self.snapshot(media)? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }
}

impl MetadataStore for SidecarStore {
    fn snapshot(&self, media: &Path) -> Result<Option<String>, Error> {
        match fs::read_to_string(Self::sidecar_path(media)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(
        &self,
        media: &Path,
        metadata: &MediaMetadata,
        transaction_id: &str,
        merged_from: &[FileId],
    ) -> Result<(), Error> {
        let document = SidecarDocument {
            metadata: metadata.clone(),
            transaction_id: transaction_id.to_string(),
            merged_from: merged_from.to_vec(),
            written_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&document)?;
        fsops::write_atomic(&Self::sidecar_path(media), &bytes)?;
        Ok(())
    }

    fn restore(&self, media: &Path, snapshot: Option<&str>) -> Result<(), Error> {
        let path = Self::sidecar_path(media);
        match snapshot {
            Some(text) => fsops::write_atomic(&path, text.as_bytes())?,
            None => match fs::remove_file(&path) {
                Ok(()) => {
                    if let Some(parent) = path.parent() {
                        fsops::fsync_dir(parent)?;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_path_appends_suffix() {
        assert_eq!(
            SidecarStore::sidecar_path(Path::new("/p/IMG_1.jpg")),
            PathBuf::from("/p/IMG_1.jpg.mdmeta.json")
        );
    }

    #[test]
    fn test_write_then_restore_absent_snapshot_removes_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("keep.jpg");
        let store = SidecarStore;
        let before = store.snapshot(&media).unwrap();
        assert!(before.is_none());

        let metadata = MediaMetadata {
            keywords: vec!["beach".into()],
            ..MediaMetadata::default()
        };
        store.write(&media, &metadata, "tx", &[2, 3]).unwrap();
        let loaded = store.load(&media).unwrap().unwrap();
        assert_eq!(loaded.metadata, metadata);
        assert_eq!(loaded.merged_from, vec![2, 3]);

        store.restore(&media, before.as_deref()).unwrap();
        assert!(!SidecarStore::sidecar_path(&media).exists());
    }

    #[test]
    fn test_restore_puts_back_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("keep.jpg");
        fs::write(SidecarStore::sidecar_path(&media), "{\"old\":true}").unwrap();
        let store = SidecarStore;
        let before = store.snapshot(&media).unwrap();

        store
            .write(&media, &MediaMetadata::default(), "tx", &[])
            .unwrap();
        store.restore(&media, before.as_deref()).unwrap();
        assert_eq!(
            fs::read_to_string(SidecarStore::sidecar_path(&media)).unwrap(),
            "{\"old\":true}"
        );
    }
}
