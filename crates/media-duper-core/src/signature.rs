//! Seams to the external scanner and hashing stages.
//!
//! Detection never reads signatures lazily: [`SignatureSnapshot::load`] pulls
//! every requested record and signature into a per-run arena up front, so the
//! parallel scoring phase only touches immutable in-memory data.

use crate::detection::{Diagnostic, DiagnosticKind};
use crate::error::Error;
use crate::model::{FileId, FileRecord, Signature};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

pub trait SignatureProvider {
    fn read_signature(&self, file_id: FileId) -> Result<Option<Signature>, Error>;
}

/// Resolves a stable file id to its current on-disk location.
pub trait FileLocator {
    fn resolve(&self, file_id: FileId) -> Result<Option<PathBuf>, Error>;
}

pub trait FileCatalog {
    fn file_record(&self, file_id: FileId) -> Result<Option<FileRecord>, Error>;
}

#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub record: FileRecord,
    pub signature: Option<Signature>,
}

#[derive(Debug, Clone, Default)]
pub struct SignatureSnapshot {
    entries: BTreeMap<FileId, SnapshotEntry>,
}

impl SignatureSnapshot {
    pub fn load(
        file_ids: &[FileId],
        catalog: &dyn FileCatalog,
        signatures: &dyn SignatureProvider,
    ) -> (Self, Vec<Diagnostic>) {
        let mut entries = BTreeMap::new();
        let mut diagnostics = Vec::new();

        for &file_id in file_ids {
            if entries.contains_key(&file_id) {
                continue;
            }
            let record = match catalog.file_record(file_id) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    diagnostics.push(Diagnostic::new(
                        file_id,
                        DiagnosticKind::UnknownFile,
                        "no file record in catalog",
                    ));
                    continue;
                }
                Err(e) => {
                    warn!("Error reading file record {}: {}", file_id, e);
                    diagnostics.push(Diagnostic::new(
                        file_id,
                        DiagnosticKind::ProviderError,
                        e.to_string(),
                    ));
                    continue;
                }
            };
            let signature = match signatures.read_signature(file_id) {
                Ok(signature) => signature,
                Err(e) => {
                    warn!("Error reading signature for file {}: {}", file_id, e);
                    diagnostics.push(Diagnostic::new(
                        file_id,
                        DiagnosticKind::ProviderError,
                        e.to_string(),
                    ));
                    None
                }
            };
            entries.insert(file_id, SnapshotEntry { record, signature });
        }

        debug!(
            "Loaded signature snapshot: {} entries, {} diagnostics",
            entries.len(),
            diagnostics.len()
        );
        (Self { entries }, diagnostics)
    }

    pub fn from_entries(entries: impl IntoIterator<Item = SnapshotEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.record.id, entry))
                .collect(),
        }
    }

    pub fn get(&self, file_id: FileId) -> Option<&SnapshotEntry> {
        self.entries.get(&file_id)
    }

    /// Entries in ascending file id order.
    pub fn iter(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
