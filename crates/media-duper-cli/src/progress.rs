use indicatif::{ProgressBar, ProgressStyle};
use media_duper_core::merge::MergeStage;
use media_duper_core::model::GroupId;
use media_duper_core::ProgressReporter;
use std::sync::Mutex;
use std::time::Duration;

const TICKS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI progress reporter using indicatif progress bars.
///
/// - Bucketing: spinner (bucket count unknown upfront)
/// - Scoring: progress bar over candidate buckets
/// - Merging: one line per transaction stage
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn set_bar(&self, pb: ProgressBar) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(old) = guard.take() {
                old.finish_and_clear();
            }
            *guard = Some(pb);
        }
    }

    fn finish_bar(&self) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(pb) = guard.take() {
                pb.finish_and_clear();
            }
        }
    }

    fn spinner(message: &str) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars(TICKS),
        );
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    }
}

impl ProgressReporter for CliReporter {
    fn on_detection_start(&self, total_files: usize) {
        self.set_bar(Self::spinner(&format!(
            "Bucketing {} files...",
            total_files
        )));
    }

    fn on_bucketing_complete(&self, buckets: usize, unscored: usize) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Bucketing complete: {} candidate buckets, {} unscored files",
            buckets, unscored
        );

        let pb = ProgressBar::new(buckets as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "  {spinner:.cyan} Scoring [{bar:30.cyan/dim}] {pos}/{len} buckets ({eta} remaining)",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━╸─")
            .tick_chars(TICKS),
        );
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_bucket_scored(&self, buckets_done: usize, _total_buckets: usize) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(pb) = guard.as_ref() {
                pb.set_position(buckets_done as u64);
            }
        }
    }

    fn on_grouping_complete(&self, groups: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Grouping complete: {} duplicate groups in {:.2}s",
            groups, duration_secs
        );
    }

    fn on_merge_stage(&self, group_id: GroupId, stage: MergeStage) {
        let mark = match stage {
            MergeStage::Committed => "\x1b[32m✓\x1b[0m",
            MergeStage::RolledBack => "\x1b[31m↺\x1b[0m",
            _ => "·",
        };
        eprintln!("  {} group {}: {}", mark, group_id, stage);
    }
}
