use crate::detection::DuplicateGroup;
use crate::merge::MergeStage;
use crate::model::GroupId;

/// Trait for reporting detection and merge progress.
///
/// The CLI implements this with indicatif progress bars.
/// All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_detection_start(&self, _total_files: usize) {}
    fn on_bucketing_complete(&self, _buckets: usize, _unscored: usize) {}
    fn on_bucket_scored(&self, _buckets_done: usize, _total_buckets: usize) {}
    fn on_grouping_complete(&self, _groups: usize, _duration_secs: f64) {}
    fn on_merge_stage(&self, _group_id: GroupId, _stage: MergeStage) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

/// Receives duplicate groups as soon as each one is finalised.
pub trait GroupSink {
    fn on_group(&mut self, group: &DuplicateGroup);
}

impl<F: FnMut(&DuplicateGroup)> GroupSink for F {
    fn on_group(&mut self, group: &DuplicateGroup) {
        self(group)
    }
}
