pub mod bucket;
pub mod group;
pub mod score;

use crate::error::Error;
use crate::model::FileId;
use serde::{Deserialize, Serialize};

pub use bucket::{
    BucketKey, BucketPlan, CandidateBucket, CandidateBucketer, ExactClass, HashBand, UnscoredFile,
};
pub use group::{DuplicateGroup, GroupBuilder, GroupKind, GroupMember, UnionFind};
pub use score::{
    MatchClass, PairOutcome, PairwiseScore, Penalty, PenaltyKind, RawDistances, Signal,
    SignalContribution, SimilarityScorer,
};

/// Per-item problem recorded during detection. Never aborts a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file_id: FileId,
    pub peer_id: Option<FileId>,
    pub kind: DiagnosticKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    UnknownFile,
    ProviderError,
    /// Missing or invalid signature; the file went to the unscored bucket.
    Unscored,
    /// Incompatible hash families or versions; the pair was not scored.
    Ambiguous,
}

impl Diagnostic {
    pub fn new(file_id: FileId, kind: DiagnosticKind, detail: impl Into<String>) -> Self {
        Self {
            file_id,
            peer_id: None,
            kind,
            detail: detail.into(),
        }
    }

    pub fn ambiguous(file_a: FileId, file_b: FileId, detail: impl Into<String>) -> Self {
        Self {
            file_id: file_a,
            peer_id: Some(file_b),
            kind: DiagnosticKind::Ambiguous,
            detail: detail.into(),
        }
    }

    /// The error this diagnostic stands for. Detection records these instead
    /// of returning them.
    pub fn to_error(&self) -> Error {
        match (self.kind, self.peer_id) {
            (DiagnosticKind::Ambiguous, Some(peer_id)) => Error::ComparisonAmbiguity {
                file_a: self.file_id,
                file_b: peer_id,
                reason: self.detail.clone(),
            },
            _ => Error::Input {
                file_id: self.file_id,
                reason: self.detail.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_map_to_error_taxonomy() {
        let unscored = Diagnostic::new(4, DiagnosticKind::Unscored, "missing signature");
        assert!(matches!(
            unscored.to_error(),
            Error::Input { file_id: 4, ref reason } if reason == "missing signature"
        ));

        let ambiguous = Diagnostic::ambiguous(1, 2, "dhash-v1 (64 bits) vs dhash-v2 (64 bits)");
        let err = ambiguous.to_error();
        assert!(matches!(
            err,
            Error::ComparisonAmbiguity {
                file_a: 1,
                file_b: 2,
                ..
            }
        ));
        assert!(err.to_string().starts_with("Files 1 and 2 cannot be compared"));
    }
}
