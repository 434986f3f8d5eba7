use super::fsops;
use super::holding::{HoldingArea, HoldingManifest};
use super::lock::GroupLocks;
use super::sidecar::MetadataStore;
use super::txlog::{TransactionLog, TransactionStatus};
use crate::error::Error;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Uncommitted transactions whose staged files were moved back.
    pub restored: Vec<String>,
    /// Leftover directories of rolled-back transactions that were removed.
    pub cleaned: Vec<String>,
    /// Transactions that could not be reconciled, with the reason.
    pub failed: Vec<(String, String)>,
    /// Uncommitted transactions left alone because their group is locked by
    /// a merge in flight.
    pub busy: Vec<String>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.restored.is_empty() && self.cleaned.is_empty() && self.failed.is_empty()
    }
}

/// Reconciles the holding area with the transaction log after a crash.
///
/// A holding subdirectory with no commit record belongs to a transaction that
/// never committed: its staged files go back, the keeper metadata is restored
/// from the manifest and the subdirectory is removed. Committed transactions
/// are left alone for undo. A transaction whose group lock is held is still
/// running and is skipped.
pub fn recover(
    holding: &HoldingArea,
    log: &TransactionLog,
    metadata: &dyn MetadataStore,
    locks: &GroupLocks,
    copy_timeout: Duration,
) -> Result<RecoveryReport, Error> {
    let mut report = RecoveryReport::default();

    for transaction_id in holding.list_transactions()? {
        match log.get(&transaction_id)?.map(|e| e.status) {
            Some(TransactionStatus::Committed) => continue,
            Some(TransactionStatus::RolledBack) => {
                holding.remove(&transaction_id)?;
                report.cleaned.push(transaction_id);
            }
            None => {
                let manifest = match holding.read_manifest(&transaction_id) {
                    Ok(manifest) => manifest,
                    Err(e) => {
                        let reason = format!("unreadable manifest: {}", e);
                        warn!(
                            transaction_id = %transaction_id,
                            "Could not recover transaction: {}", reason
                        );
                        report.failed.push((transaction_id, reason));
                        continue;
                    }
                };
                let _guard = match &manifest {
                    Some(manifest) => match locks.try_acquire(manifest.group_id) {
                        Ok(guard) => Some(guard),
                        Err(Error::GroupBusy(group_id)) => {
                            debug!(
                                transaction_id = %transaction_id,
                                "Group {} has a merge in flight; not recovering", group_id
                            );
                            report.busy.push(transaction_id);
                            continue;
                        }
                        Err(e) => return Err(e),
                    },
                    None => None,
                };
                // The commit may have landed while the lock was being taken.
                if log.get(&transaction_id)?.is_some() {
                    continue;
                }
                match restore_uncommitted(
                    holding,
                    metadata,
                    &transaction_id,
                    manifest.as_ref(),
                    copy_timeout,
                ) {
                    Ok(()) => {
                        info!(
                            transaction_id = %transaction_id,
                            "Recovered uncommitted transaction"
                        );
                        report.restored.push(transaction_id);
                    }
                    Err(reason) => {
                        warn!(
                            transaction_id = %transaction_id,
                            "Could not recover transaction: {}", reason
                        );
                        report.failed.push((transaction_id, reason));
                    }
                }
            }
        }
    }

    if !report.is_clean() {
        info!(
            "Recovery: {} restored, {} cleaned, {} failed",
            report.restored.len(),
            report.cleaned.len(),
            report.failed.len()
        );
    }
    Ok(report)
}

fn restore_uncommitted(
    holding: &HoldingArea,
    metadata: &dyn MetadataStore,
    transaction_id: &str,
    manifest: Option<&HoldingManifest>,
    copy_timeout: Duration,
) -> Result<(), String> {
    let Some(manifest) = manifest else {
        let staged = holding
            .staged_count(transaction_id)
            .map_err(|e| e.to_string())?;
        if staged > 0 {
            return Err(format!("{} staged files but no manifest", staged));
        }
        return holding.remove(transaction_id).map_err(|e| e.to_string());
    };

    for entry in &manifest.entries {
        if !entry.staged_path.exists() {
            continue;
        }
        if entry.original_path.exists() {
            return Err(format!(
                "{} is occupied; staged copy kept at {}",
                entry.original_path.display(),
                entry.staged_path.display()
            ));
        }
        fsops::move_file(&entry.staged_path, &entry.original_path, copy_timeout)
            .map_err(|e| format!("could not restore {}: {}", entry.original_path.display(), e))?;
    }
    metadata
        .restore(&manifest.keeper_path, manifest.metadata_before.as_deref())
        .map_err(|e| format!("could not restore keeper metadata: {}", e))?;
    holding.remove(transaction_id).map_err(|e| e.to_string())
}
