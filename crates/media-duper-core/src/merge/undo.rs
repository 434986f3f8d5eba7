use super::fsops;
use super::holding::HoldingArea;
use super::sidecar::MetadataStore;
use super::txlog::{TransactionLog, TransactionLogEntry, TransactionStatus};
use crate::error::{Error, UndoError};
use crate::model::{FileId, GroupId, MediaMetadata};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct UndoOutcome {
    pub transaction_id: String,
    pub group_id: GroupId,
    pub keeper_id: FileId,
    pub restored: Vec<FileId>,
    /// Keeper catalog metadata to put back.
    pub catalog_metadata: MediaMetadata,
    pub rolled_back_at: DateTime<Utc>,
}

enum Restore {
    Move,
    AlreadyInPlace,
}

/// Reverses committed merges from their holding areas.
pub struct UndoManager<'a> {
    pub log: &'a TransactionLog,
    pub holding: &'a HoldingArea,
    pub metadata: &'a dyn MetadataStore,
    pub retention: Duration,
    pub copy_timeout: Duration,
}

impl<'a> UndoManager<'a> {
    /// Committed transactions still within retention whose holding area
    /// survives, newest first.
    pub fn list_undoable(&self) -> Result<Vec<TransactionLogEntry>, Error> {
        let now = Utc::now();
        let mut entries: Vec<TransactionLogEntry> = self
            .log
            .entries()?
            .into_iter()
            .filter(|e| e.status == TransactionStatus::Committed)
            .filter(|e| !self.expired(e, now))
            .filter(|e| self.holding.exists(&e.transaction_id))
            .collect();
        entries.sort_by(|a, b| b.committed_at.cmp(&a.committed_at));
        Ok(entries)
    }

    /// Restores every removed file and the keeper's previous metadata.
    ///
    /// All preconditions are checked before the first file moves, so a refused
    /// undo changes nothing. An undo interrupted midway can simply be run again.
    pub fn undo(&self, transaction_id: &str) -> Result<UndoOutcome, Error> {
        let entry = self
            .log
            .get(transaction_id)?
            .ok_or_else(|| UndoError::UnknownTransaction(transaction_id.to_string()))?;
        if entry.status == TransactionStatus::RolledBack {
            return Err(UndoError::AlreadyRolledBack(transaction_id.to_string()).into());
        }
        if self.expired(&entry, Utc::now()) {
            return Err(UndoError::RetentionExpired(transaction_id.to_string()).into());
        }
        if !self.holding.exists(transaction_id) {
            return Err(UndoError::HoldingAreaPurged(transaction_id.to_string()).into());
        }

        let mut steps = Vec::with_capacity(entry.removed.len());
        for removed in &entry.removed {
            let staged = removed.staged_path.exists();
            let original = removed.original_path.exists();
            let step = match (staged, original) {
                (true, false) => Restore::Move,
                (false, true) if fsops::file_digest(&removed.original_path)? == removed.digest => {
                    Restore::AlreadyInPlace
                }
                (true, true) | (false, true) => {
                    return Err(UndoError::DestinationOccupied {
                        path: removed.original_path.display().to_string(),
                    }
                    .into())
                }
                (false, false) => {
                    return Err(UndoError::HoldingAreaPurged(transaction_id.to_string()).into())
                }
            };
            steps.push(step);
        }

        for (removed, step) in entry.removed.iter().zip(steps) {
            if let Restore::Move = step {
                fsops::move_file(
                    &removed.staged_path,
                    &removed.original_path,
                    self.copy_timeout,
                )?;
                debug!(
                    transaction_id,
                    "Restored file {} to {}",
                    removed.file_id,
                    removed.original_path.display()
                );
            }
        }
        self.metadata
            .restore(&entry.keeper_path, entry.metadata_before.as_deref())?;

        let rolled_back_at = self.log.append_rollback(transaction_id)?;
        self.holding.remove(transaction_id)?;
        info!(
            transaction_id,
            group_id = entry.group_id,
            "Undo complete: restored {} files",
            entry.removed.len()
        );

        Ok(UndoOutcome {
            transaction_id: transaction_id.to_string(),
            group_id: entry.group_id,
            keeper_id: entry.keeper_id,
            restored: entry.removed_ids(),
            catalog_metadata: entry.catalog_metadata_before.clone(),
            rolled_back_at,
        })
    }

    fn expired(&self, entry: &TransactionLogEntry, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.retention) {
            Ok(retention) => entry.committed_at + retention < now,
            Err(_) => false,
        }
    }
}
