use crate::merge::MergeStage;
use crate::model::{FileId, GroupId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input for file {file_id}: {reason}")]
    Input { file_id: FileId, reason: String },

    #[error("Files {file_a} and {file_b} cannot be compared: {reason}")]
    ComparisonAmbiguity {
        file_a: FileId,
        file_b: FileId,
        reason: String,
    },

    #[error("Planning failed: {0}")]
    Planning(#[from] PlanningError),

    #[error("Plan is stale, file {file_id} {reason}; re-run detection. No files were moved")]
    StalePlan { file_id: FileId, reason: String },

    #[error("Group {0} already has a merge in flight")]
    GroupBusy(GroupId),

    #[error(
        "Merge of group {group_id} failed during {stage}: {source}. \
         The transaction was rolled back; no files were deleted"
    )]
    Transaction {
        group_id: GroupId,
        stage: MergeStage,
        #[source]
        source: Box<Error>,
    },

    #[error(
        "Merge of group {group_id} failed during {stage}: {source}; rollback incomplete ({rollback}). \
         No files were deleted; staged files remain in the holding area for recovery"
    )]
    RollbackIncomplete {
        group_id: GroupId,
        stage: MergeStage,
        #[source]
        source: Box<Error>,
        rollback: String,
    },

    #[error("Merge of group {group_id} interrupted after {stage}")]
    Interrupted { group_id: GroupId, stage: MergeStage },

    #[error("Undo failed: {0}")]
    Undo(#[from] UndoError),

    #[error("Transaction log is corrupt at line {line}: {reason}")]
    CorruptLog { line: usize, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("group {0} not found")]
    GroupNotFound(GroupId),

    #[error("group {0} is no longer open")]
    GroupClosed(GroupId),

    #[error("group {group_id} has {members} present member(s); at least 2 are required")]
    TooFewMembers { group_id: GroupId, members: usize },

    #[error("every member of group {0} has already been removed")]
    AllMembersRemoved(GroupId),

    #[error("keeper {file_id} is no longer present on disk; re-run detection")]
    KeeperMissing { file_id: FileId },

    #[error("file {file_id} is not a member of group {group_id}")]
    KeeperNotInGroup { group_id: GroupId, file_id: FileId },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UndoError {
    #[error("transaction {0} is unknown")]
    UnknownTransaction(String),

    #[error("transaction {0} has already been rolled back")]
    AlreadyRolledBack(String),

    #[error("transaction {0} is past the retention window")]
    RetentionExpired(String),

    #[error("holding area for transaction {0} has been purged")]
    HoldingAreaPurged(String),

    #[error("cannot restore {path}: a file already exists there")]
    DestinationOccupied { path: String },
}

impl Error {
    /// Stage at which a merge transaction failed, if this is a merge failure.
    pub fn failed_stage(&self) -> Option<MergeStage> {
        match self {
            Error::Transaction { stage, .. }
            | Error::RollbackIncomplete { stage, .. }
            | Error::Interrupted { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
