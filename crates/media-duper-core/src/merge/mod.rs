pub mod executor;
pub mod fsops;
pub mod holding;
pub mod lock;
pub mod plan;
pub mod recovery;
pub mod sidecar;
pub mod txlog;
pub mod undo;

pub use executor::{FaultPlan, FaultPoint, MergeOutcome, TransactionalMergeExecutor};
pub use holding::{HoldingArea, HoldingManifest, StagedEntry};
pub use lock::{GroupLockGuard, GroupLocks};
pub use plan::{FieldMerge, MergePlan, MergePlanner, MetadataField, PlannedFile};
pub use recovery::RecoveryReport;
pub use sidecar::{MetadataStore, SidecarDocument, SidecarStore};
pub use txlog::{RemovedFile, TransactionLog, TransactionLogEntry, TransactionStatus};
pub use undo::{UndoManager, UndoOutcome};

use crate::config::{ConfigProvider, MergeConfig};
use crate::error::Error;
use crate::model::{FileId, GroupId, GroupStatus};
use crate::progress::{ProgressReporter, SilentReporter};
use crate::storage::Database;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

/// Lifecycle of one merge transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStage {
    Planned,
    MetadataWriting,
    FilesStaging,
    Committed,
    RolledBack,
}

impl MergeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStage::Planned => "planned",
            MergeStage::MetadataWriting => "metadata_writing",
            MergeStage::FilesStaging => "files_staging",
            MergeStage::Committed => "committed",
            MergeStage::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for MergeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plans, executes, undoes and recovers merges against one catalog.
///
/// Opening the service replays the transaction log and runs crash recovery
/// before anything else can touch the holding area.
pub struct MergeService {
    db: Mutex<Database>,
    config: MergeConfig,
    holding: HoldingArea,
    log: TransactionLog,
    metadata: Box<dyn MetadataStore>,
    locks: GroupLocks,
    faults: Mutex<FaultPlan>,
    cancel: Arc<AtomicBool>,
    startup_recovery: RecoveryReport,
}

impl MergeService {
    pub fn open(db: Database, config: &MergeConfig) -> Result<Self, Error> {
        Self::with_metadata_store(db, config, Box::new(SidecarStore))
    }

    /// Opens the service with the merge settings `provider` supplies now.
    /// The holding area and log stay fixed for the life of the service.
    pub fn from_provider(db: Database, provider: &dyn ConfigProvider) -> Result<Self, Error> {
        Self::open(db, &provider.merge_config())
    }

    pub fn with_metadata_store(
        db: Database,
        config: &MergeConfig,
        metadata: Box<dyn MetadataStore>,
    ) -> Result<Self, Error> {
        let holding = HoldingArea::open(&config.holding_dir)?;
        let partial = holding.clear_partial()?;
        if partial > 0 {
            info!("Removed {} unfinished transaction directories", partial);
        }
        let log = TransactionLog::open(&config.transaction_log_path)?;
        let locks = GroupLocks::new(holding.lock_dir());
        let mut service = Self {
            db: Mutex::new(db),
            config: config.clone(),
            holding,
            log,
            metadata,
            locks,
            faults: Mutex::new(FaultPlan::default()),
            cancel: Arc::new(AtomicBool::new(false)),
            startup_recovery: RecoveryReport::default(),
        };
        service.startup_recovery = service.recover()?;
        Ok(service)
    }

    pub fn database(&self) -> Result<MutexGuard<'_, Database>, Error> {
        lock(&self.db)
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn holding(&self) -> &HoldingArea {
        &self.holding
    }

    /// What recovery did when the service was opened.
    pub fn startup_recovery(&self) -> &RecoveryReport {
        &self.startup_recovery
    }

    /// Setting the token stops merges that have not started staging files.
    /// Each `execute_merge*` call clears it when it finishes.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn set_fault_plan(&self, faults: FaultPlan) -> Result<(), Error> {
        *lock(&self.faults)? = faults;
        Ok(())
    }

    pub fn plan_merge(
        &self,
        group_id: GroupId,
        keeper_override: Option<FileId>,
    ) -> Result<MergePlan, Error> {
        let db = self.database()?;
        MergePlanner::new(&db).plan(group_id, keeper_override)
    }

    pub fn execute_merge(&self, plan: &MergePlan) -> Result<MergeOutcome, Error> {
        self.execute_merge_with(plan, &SilentReporter)
    }

    pub fn execute_merge_with(
        &self,
        plan: &MergePlan,
        reporter: &dyn ProgressReporter,
    ) -> Result<MergeOutcome, Error> {
        let result = self.run_merge(plan, reporter);
        self.cancel.store(false, Ordering::Relaxed);
        result
    }

    fn run_merge(
        &self,
        plan: &MergePlan,
        reporter: &dyn ProgressReporter,
    ) -> Result<MergeOutcome, Error> {
        let executor = TransactionalMergeExecutor {
            holding: &self.holding,
            log: &self.log,
            metadata: self.metadata.as_ref(),
            locks: &self.locks,
            copy_timeout: self.config.copy_timeout(),
            faults: lock(&self.faults)?.clone(),
        };
        let outcome = executor.execute(plan, &self.cancel, reporter)?;

        // The log record is the commit; the catalog follows it and is
        // reconciled on the next start if this fails.
        if let Err(e) = self.sync_committed(plan) {
            error!(
                group_id = plan.group_id,
                transaction_id = %outcome.transaction_id,
                "Merge committed but catalog update failed: {}", e
            );
        }
        Ok(outcome)
    }

    /// Executes independent plans concurrently, bounded by
    /// `max_concurrent_merges`. Each plan is its own transaction; one failing
    /// does not affect the others.
    pub fn execute_merge_batch(
        &self,
        plans: &[MergePlan],
    ) -> Result<Vec<(GroupId, Result<MergeOutcome, Error>)>, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.max_concurrent_merges.max(1))
            .build()
            .map_err(|e| Error::Other(format!("could not start merge workers: {}", e)))?;

        let results: Vec<(GroupId, Result<MergeOutcome, Error>)> = pool.install(|| {
            plans
                .par_iter()
                .map(|plan| (plan.group_id, self.run_merge(plan, &SilentReporter)))
                .collect()
        });
        self.cancel.store(false, Ordering::Relaxed);

        let committed = results.iter().filter(|(_, r)| r.is_ok()).count();
        info!(
            "Batch merge finished: {} of {} groups committed",
            committed,
            plans.len()
        );
        Ok(results)
    }

    pub fn list_undoable(&self) -> Result<Vec<TransactionLogEntry>, Error> {
        self.undo_manager().list_undoable()
    }

    pub fn undo(&self, transaction_id: &str) -> Result<UndoOutcome, Error> {
        let outcome = self.undo_manager().undo(transaction_id)?;
        if let Err(e) = self.sync_undone(&outcome) {
            error!(
                transaction_id,
                "Undo complete but catalog update failed: {}", e
            );
        }
        Ok(outcome)
    }

    /// Reverses uncommitted transactions left in the holding area and brings
    /// the catalog in line with committed ones.
    pub fn recover(&self) -> Result<RecoveryReport, Error> {
        let report = recovery::recover(
            &self.holding,
            &self.log,
            self.metadata.as_ref(),
            &self.locks,
            self.config.copy_timeout(),
        )?;
        self.reconcile_catalog()?;
        Ok(report)
    }

    fn undo_manager(&self) -> UndoManager<'_> {
        UndoManager {
            log: &self.log,
            holding: &self.holding,
            metadata: self.metadata.as_ref(),
            retention: self.config.retention(),
            copy_timeout: self.config.copy_timeout(),
        }
    }

    fn sync_committed(&self, plan: &MergePlan) -> Result<(), Error> {
        let db = self.database()?;
        db.mark_files_removed(&plan.removal_ids())?;
        db.update_file_metadata(plan.keeper.file_id, &plan.merged_metadata)?;
        db.set_group_status(plan.group_id, GroupStatus::Resolved)?;
        Ok(())
    }

    fn sync_undone(&self, outcome: &UndoOutcome) -> Result<(), Error> {
        let db = self.database()?;
        db.restore_files(&outcome.restored)?;
        db.update_file_metadata(outcome.keeper_id, &outcome.catalog_metadata)?;

        let mut members = outcome.restored.clone();
        members.push(outcome.keeper_id);
        let conflict = db
            .get_duplicate_groups(Some(GroupStatus::Open))?
            .into_iter()
            .find(|g| g.id != outcome.group_id && members.iter().any(|id| g.contains(*id)));
        match conflict {
            Some(other) => warn!(
                group_id = outcome.group_id,
                "Group left resolved: its files now belong to open group {}", other.id
            ),
            None => {
                db.set_group_status(outcome.group_id, GroupStatus::Open)?;
            }
        }
        Ok(())
    }

    /// Re-applies catalog updates for committed transactions whose removals
    /// the catalog still lists as present.
    fn reconcile_catalog(&self) -> Result<(), Error> {
        let db = self.database()?;
        for entry in self.log.entries()? {
            if entry.status != TransactionStatus::Committed {
                continue;
            }
            let mut stale = Vec::new();
            for file_id in entry.removed_ids() {
                if db.get_file_record(file_id)?.is_some() && !db.is_file_removed(file_id)? {
                    stale.push(file_id);
                }
            }
            if stale.is_empty() {
                continue;
            }
            db.mark_files_removed(&stale)?;
            db.update_file_metadata(entry.keeper_id, &entry.metadata_after)?;
            db.set_group_status(entry.group_id, GroupStatus::Resolved)?;
            info!(
                group_id = entry.group_id,
                transaction_id = %entry.transaction_id,
                "Reconciled catalog with committed merge ({} files)",
                stale.len()
            );
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, Error> {
    mutex
        .lock()
        .map_err(|_| Error::Other("merge service state poisoned by a panic".to_string()))
}
