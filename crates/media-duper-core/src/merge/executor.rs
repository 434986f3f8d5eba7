use super::fsops;
use super::holding::{HoldingArea, HoldingManifest, StagedEntry};
use super::lock::GroupLocks;
use super::plan::{MergePlan, PlannedFile};
use super::sidecar::MetadataStore;
use super::txlog::{RemovedFile, TransactionLog, TransactionLogEntry, TransactionStatus};
use super::MergeStage;
use crate::error::Error;
use crate::model::{FileId, GroupId};
use crate::progress::ProgressReporter;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Points inside a transaction where a fault can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    AfterManifest,
    AfterMetadata,
    /// After the n-th removal (0-based) has been staged.
    AfterStaging(usize),
    BeforeCommit,
    /// Writing the commit record itself fails.
    CommitWrite,
}

/// Test seam: make a transaction fail, or stop dead as if the process had
/// crashed, at a chosen point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultPlan {
    pub fail_at: Option<FaultPoint>,
    pub crash_at: Option<FaultPoint>,
}

impl FaultPlan {
    pub fn fail_at(point: FaultPoint) -> Self {
        Self {
            fail_at: Some(point),
            crash_at: None,
        }
    }

    pub fn crash_at(point: FaultPoint) -> Self {
        Self {
            fail_at: None,
            crash_at: Some(point),
        }
    }

    fn check(&self, point: FaultPoint, group_id: GroupId, stage: MergeStage) -> Result<(), Error> {
        if self.crash_at == Some(point) {
            return Err(Error::Interrupted { group_id, stage });
        }
        if self.fail_at == Some(point) {
            return Err(Error::Other(format!("injected failure at {:?}", point)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub transaction_id: String,
    pub group_id: GroupId,
    pub keeper_id: FileId,
    pub removed: Vec<FileId>,
    pub reclaimed_bytes: u64,
    pub committed_at: DateTime<Utc>,
}

/// What has been done so far, so exactly that can be undone.
#[derive(Default)]
struct Applied {
    metadata_written: bool,
    staged: Vec<(PathBuf, PathBuf)>,
}

/// Runs one merge plan as a transaction:
/// planned → metadata written → files staged → committed.
///
/// Nothing is deleted. Removals are moved into the holding area and the
/// transaction becomes durable only when its log record is fsynced. Any
/// failure before that rolls every completed step back.
pub struct TransactionalMergeExecutor<'a> {
    pub holding: &'a HoldingArea,
    pub log: &'a TransactionLog,
    pub metadata: &'a dyn MetadataStore,
    pub locks: &'a GroupLocks,
    pub copy_timeout: Duration,
    pub faults: FaultPlan,
}

impl<'a> TransactionalMergeExecutor<'a> {
    pub fn execute(
        &self,
        plan: &MergePlan,
        cancel: &AtomicBool,
        reporter: &dyn ProgressReporter,
    ) -> Result<MergeOutcome, Error> {
        let group_id = plan.group_id;
        let _guard = self.locks.try_acquire(group_id)?;

        if cancel.load(Ordering::Relaxed) {
            info!(group_id, "Merge cancelled before any change");
            return Err(Error::Cancelled);
        }
        revalidate(plan)?;

        let transaction_id = Uuid::new_v4().to_string();
        let metadata_before = self.metadata.snapshot(&plan.keeper.path)?;
        let manifest = HoldingManifest {
            transaction_id: transaction_id.clone(),
            group_id,
            keeper_id: plan.keeper.file_id,
            keeper_path: plan.keeper.path.clone(),
            metadata_before,
            entries: plan
                .removals
                .iter()
                .enumerate()
                .map(|(index, file)| StagedEntry {
                    file_id: file.file_id,
                    original_path: file.path.clone(),
                    staged_path: self.holding.staged_path(&transaction_id, index, &file.path),
                    size: file.size,
                    digest: file.digest.clone(),
                })
                .collect(),
            created_at: Utc::now(),
        };

        reporter.on_merge_stage(group_id, MergeStage::Planned);
        if let Err(e) = self.holding.begin(&manifest) {
            if let Err(cleanup) = self.holding.remove(&transaction_id) {
                warn!(group_id, "Could not remove partial holding area: {}", cleanup);
            }
            return Err(Error::Transaction {
                group_id,
                stage: MergeStage::Planned,
                source: Box::new(e),
            });
        }
        debug!(group_id, transaction_id = %transaction_id, "Transaction started");

        let mut applied = Applied::default();
        let mut stage = MergeStage::Planned;
        let result = self.apply(plan, &manifest, &mut applied, &mut stage, cancel, reporter);

        match result {
            Ok(outcome) => {
                reporter.on_merge_stage(group_id, MergeStage::Committed);
                info!(
                    group_id,
                    transaction_id = %outcome.transaction_id,
                    "Merge committed: kept {}, staged {} files",
                    outcome.keeper_id,
                    outcome.removed.len()
                );
                Ok(outcome)
            }
            Err(Error::Interrupted { group_id, stage }) => {
                warn!(group_id, stage = %stage, "Merge interrupted; holding area left for recovery");
                Err(Error::Interrupted { group_id, stage })
            }
            Err(source) => {
                warn!(group_id, stage = %stage, "Merge failed: {}; rolling back", source);
                match self.rollback(&manifest, &applied) {
                    Ok(()) => {
                        reporter.on_merge_stage(group_id, MergeStage::RolledBack);
                        Err(Error::Transaction {
                            group_id,
                            stage,
                            source: Box::new(source),
                        })
                    }
                    Err(rollback) => {
                        error!(group_id, stage = %stage, "Rollback incomplete: {}", rollback);
                        Err(Error::RollbackIncomplete {
                            group_id,
                            stage,
                            source: Box::new(source),
                            rollback,
                        })
                    }
                }
            }
        }
    }

    fn apply(
        &self,
        plan: &MergePlan,
        manifest: &HoldingManifest,
        applied: &mut Applied,
        stage: &mut MergeStage,
        cancel: &AtomicBool,
        reporter: &dyn ProgressReporter,
    ) -> Result<MergeOutcome, Error> {
        let group_id = plan.group_id;
        self.faults
            .check(FaultPoint::AfterManifest, group_id, *stage)?;

        *stage = MergeStage::MetadataWriting;
        reporter.on_merge_stage(group_id, *stage);
        self.metadata.write(
            &plan.keeper.path,
            &plan.merged_metadata,
            &manifest.transaction_id,
            &plan.removal_ids(),
        )?;
        applied.metadata_written = true;
        self.faults
            .check(FaultPoint::AfterMetadata, group_id, *stage)?;

        *stage = MergeStage::FilesStaging;
        reporter.on_merge_stage(group_id, *stage);
        let mut refused = false;
        for (index, entry) in manifest.entries.iter().enumerate() {
            if !refused && cancel.load(Ordering::Relaxed) {
                warn!(group_id, "Cancellation refused: files are already being staged");
                refused = true;
            }
            let method =
                fsops::move_file(&entry.original_path, &entry.staged_path, self.copy_timeout)?;
            applied
                .staged
                .push((entry.original_path.clone(), entry.staged_path.clone()));
            debug!(
                group_id,
                "Staged file {} ({:?}) to {}",
                entry.file_id,
                method,
                entry.staged_path.display()
            );
            self.faults
                .check(FaultPoint::AfterStaging(index), group_id, *stage)?;
        }
        self.faults
            .check(FaultPoint::BeforeCommit, group_id, *stage)?;

        let committed_at = Utc::now();
        let entry = TransactionLogEntry {
            transaction_id: manifest.transaction_id.clone(),
            group_id,
            keeper_id: plan.keeper.file_id,
            keeper_path: plan.keeper.path.clone(),
            removed: manifest
                .entries
                .iter()
                .map(|e| RemovedFile {
                    file_id: e.file_id,
                    original_path: e.original_path.clone(),
                    staged_path: e.staged_path.clone(),
                    size: e.size,
                    digest: e.digest.clone(),
                })
                .collect(),
            metadata_before: manifest.metadata_before.clone(),
            catalog_metadata_before: plan.keeper_metadata.clone(),
            metadata_after: plan.merged_metadata.clone(),
            committed_at,
            status: TransactionStatus::Committed,
            rolled_back_at: None,
        };
        self.faults
            .check(FaultPoint::CommitWrite, group_id, *stage)
            .and_then(|()| self.log.append_commit(&entry))?;
        *stage = MergeStage::Committed;

        Ok(MergeOutcome {
            transaction_id: manifest.transaction_id.clone(),
            group_id,
            keeper_id: plan.keeper.file_id,
            removed: plan.removal_ids(),
            reclaimed_bytes: plan.reclaimed_bytes(),
            committed_at,
        })
    }

    /// Reverses the applied steps in reverse order. Stops at the first file it
    /// cannot move back, leaving the holding area for recovery.
    fn rollback(&self, manifest: &HoldingManifest, applied: &Applied) -> Result<(), String> {
        let group_id = manifest.group_id;
        for (original, staged) in applied.staged.iter().rev() {
            fsops::move_file(staged, original, self.copy_timeout).map_err(|e| {
                format!(
                    "could not move {} back to {}: {}",
                    staged.display(),
                    original.display(),
                    e
                )
            })?;
            debug!(group_id, "Restored {}", original.display());
        }
        if applied.metadata_written {
            self.metadata
                .restore(&manifest.keeper_path, manifest.metadata_before.as_deref())
                .map_err(|e| format!("could not restore keeper metadata: {}", e))?;
        }
        self.holding
            .remove(&manifest.transaction_id)
            .map_err(|e| format!("could not remove holding area: {}", e))?;
        info!(group_id, transaction_id = %manifest.transaction_id, "Transaction rolled back");
        Ok(())
    }
}

/// Confirms every planned file is still what the plan saw.
fn revalidate(plan: &MergePlan) -> Result<(), Error> {
    for file in std::iter::once(&plan.keeper).chain(&plan.removals) {
        check_unchanged(file)?;
    }
    Ok(())
}

fn check_unchanged(file: &PlannedFile) -> Result<(), Error> {
    let stale = |reason: String| Error::StalePlan {
        file_id: file.file_id,
        reason,
    };
    let metadata = match std::fs::metadata(&file.path) {
        Ok(metadata) => metadata,
        Err(_) => return Err(stale(format!("is missing from {}", file.path.display()))),
    };
    if metadata.len() != file.size {
        return Err(stale(format!(
            "changed size ({} -> {} bytes)",
            file.size,
            metadata.len()
        )));
    }
    let digest = fsops::file_digest(&file.path)?;
    if digest != file.digest {
        return Err(stale("changed content".to_string()));
    }
    Ok(())
}
