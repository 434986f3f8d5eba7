use crate::config::{ConfigProvider, DetectionConfig};
use crate::detection::{
    CandidateBucket, CandidateBucketer, Diagnostic, DiagnosticKind, DuplicateGroup,
    GroupBuilder, PairOutcome, PairwiseScore, SimilarityScorer, UnscoredFile,
};
use crate::error::Error;
use crate::model::FileId;
use crate::progress::{GroupSink, ProgressReporter};
use crate::signature::{FileCatalog, SignatureProvider, SignatureSnapshot};
use crate::storage::{Database, PersistSummary};
use ahash::AHashMap;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Groups candidate duplicates across a file population.
pub struct DetectionEngine {
    config: DetectionConfig,
    provider: Option<Arc<dyn ConfigProvider + Send + Sync>>,
    cancel: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Default)]
pub struct DetectionStats {
    pub files: usize,
    pub unscored_files: usize,
    pub exact_classes: usize,
    pub buckets: usize,
    pub candidate_pairs: u64,
    pub hash_comparisons: u64,
    pub accepted_edges: usize,
    pub groups: usize,
    pub flagged_groups: usize,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct DetectionReport {
    pub groups: Vec<DuplicateGroup>,
    pub diagnostics: Vec<Diagnostic>,
    pub unscored: Vec<UnscoredFile>,
    pub stats: DetectionStats,
}

struct BucketResult {
    edges: Vec<PairwiseScore>,
    diagnostics: Vec<Diagnostic>,
    pairs: u64,
}

impl DetectionEngine {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            config,
            provider: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Reads thresholds and weights from `provider` at the start of every run,
    /// so overrides apply without rebuilding the engine.
    pub fn with_provider(provider: Arc<dyn ConfigProvider + Send + Sync>) -> Self {
        Self {
            config: provider.detection_config(),
            provider: Some(provider),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Settings the next run will use.
    pub fn current_config(&self) -> DetectionConfig {
        match &self.provider {
            Some(provider) => provider.detection_config(),
            None => self.config.clone(),
        }
    }

    /// Setting the returned flag stops the run at the next bucket boundary.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Loads the snapshot for `file_ids` and runs detection over it.
    pub fn run(
        &self,
        catalog: &dyn FileCatalog,
        signatures: &dyn SignatureProvider,
        file_ids: &[FileId],
        sink: &mut dyn GroupSink,
        reporter: &dyn ProgressReporter,
    ) -> Result<DetectionReport, Error> {
        info!("Loading signatures for {} files...", file_ids.len());
        let (snapshot, load_diagnostics) = SignatureSnapshot::load(file_ids, catalog, signatures);
        let mut report = self.detect(&snapshot, sink, reporter)?;
        report.stats.files = file_ids.len();
        let mut diagnostics = load_diagnostics;
        diagnostics.append(&mut report.diagnostics);
        report.diagnostics = diagnostics;
        Ok(report)
    }

    /// Runs detection over every file in the catalog and persists the result.
    pub fn run_catalog(
        &self,
        db: &Database,
        sink: &mut dyn GroupSink,
        reporter: &dyn ProgressReporter,
    ) -> Result<(DetectionReport, PersistSummary), Error> {
        let file_ids = db.present_file_ids()?;
        let report = self.run(db, db, &file_ids, sink, reporter)?;
        let summary = db.save_detection_run(&report)?;
        Ok((report, summary))
    }

    /// Runs detection over an already loaded snapshot.
    pub fn detect(
        &self,
        snapshot: &SignatureSnapshot,
        sink: &mut dyn GroupSink,
        reporter: &dyn ProgressReporter,
    ) -> Result<DetectionReport, Error> {
        let start = Instant::now();
        let config = self.current_config();
        config.validate()?;
        reporter.on_detection_start(snapshot.len());

        // Phase 1: Bucket
        info!("Bucketing {} files...", snapshot.len());
        let plan = CandidateBucketer::new(&config).partition(snapshot);
        reporter.on_bucketing_complete(plan.buckets.len(), plan.unscored.len());
        for unscored in &plan.unscored {
            debug!("File {} is unscored: {}", unscored.file_id, unscored.reason);
        }
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Phase 2: Score
        info!("Scoring {} candidate buckets...", plan.buckets.len());
        let scorer = SimilarityScorer::new(&config);
        let results = self.score_buckets(&scorer, snapshot, &plan.buckets, reporter)?;
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut diagnostics: Vec<Diagnostic> = plan
            .unscored
            .iter()
            .map(|u| Diagnostic::new(u.file_id, DiagnosticKind::Unscored, u.reason.clone()))
            .collect();
        let mut edges = plan.exact_edges();
        let mut candidate_pairs = 0;
        let mut ambiguous: Vec<Diagnostic> = Vec::new();
        for result in results {
            candidate_pairs += result.pairs;
            edges.extend(result.edges);
            ambiguous.extend(result.diagnostics);
        }
        ambiguous.sort_by_key(|d| (d.file_id, d.peer_id));
        diagnostics.append(&mut ambiguous);

        // Phase 3: Group
        info!("Grouping {} accepted edges...", edges.len());
        let builder = GroupBuilder::new(&scorer, snapshot);
        let (groups, mut group_diagnostics) = builder.build(edges, |group| sink.on_group(group));
        diagnostics.append(&mut group_diagnostics);

        let accepted_edges = groups.iter().map(|g| g.edges.len()).sum();
        let stats = DetectionStats {
            files: snapshot.len(),
            unscored_files: plan.unscored.len(),
            exact_classes: plan.exact_classes.len(),
            buckets: plan.buckets.len(),
            candidate_pairs,
            hash_comparisons: scorer.hash_comparisons(),
            accepted_edges,
            groups: groups.len(),
            flagged_groups: groups.iter().filter(|g| g.needs_manual_split).count(),
            duration: start.elapsed(),
        };
        reporter.on_grouping_complete(groups.len(), stats.duration.as_secs_f64());
        info!(
            "Detection completed in {:.2}s: {} groups ({} flagged), {} hash comparisons",
            stats.duration.as_secs_f64(),
            stats.groups,
            stats.flagged_groups,
            stats.hash_comparisons,
        );

        Ok(DetectionReport {
            groups,
            diagnostics,
            unscored: plan.unscored,
            stats,
        })
    }

    fn score_buckets(
        &self,
        scorer: &SimilarityScorer<'_>,
        snapshot: &SignatureSnapshot,
        buckets: &[CandidateBucket],
        reporter: &dyn ProgressReporter,
    ) -> Result<Vec<BucketResult>, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(scorer.config().worker_threads)
            .build()
            .map_err(|e| Error::Other(format!("failed to build worker pool: {}", e)))?;

        let memberships = BucketMemberships::new(buckets);
        let done = AtomicUsize::new(0);
        let total = buckets.len();
        let results = pool.install(|| {
            buckets
                .par_iter()
                .enumerate()
                .map(|(index, bucket)| {
                    if self.is_cancelled() {
                        return None;
                    }
                    let result = score_bucket(scorer, snapshot, &memberships, index, bucket);
                    let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                    reporter.on_bucket_scored(finished, total);
                    Some(result)
                })
                .collect::<Vec<Option<BucketResult>>>()
        });

        if results.iter().any(Option::is_none) {
            warn!("Detection cancelled after {} of {} buckets", done.into_inner(), total);
            return Err(Error::Cancelled);
        }
        Ok(results.into_iter().flatten().collect())
    }
}

/// Ascending bucket indices per file. A pair sharing several buckets is
/// scored only in the first of them.
struct BucketMemberships {
    by_file: AHashMap<FileId, Vec<usize>>,
}

impl BucketMemberships {
    fn new(buckets: &[CandidateBucket]) -> Self {
        let mut by_file: AHashMap<FileId, Vec<usize>> = AHashMap::new();
        for (index, bucket) in buckets.iter().enumerate() {
            for &file_id in &bucket.members {
                by_file.entry(file_id).or_default().push(index);
            }
        }
        Self { by_file }
    }

    fn first_shared(&self, a: FileId, b: FileId) -> Option<usize> {
        let (Some(left), Some(right)) = (self.by_file.get(&a), self.by_file.get(&b)) else {
            return None;
        };
        let (mut i, mut j) = (0, 0);
        while i < left.len() && j < right.len() {
            match left[i].cmp(&right[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => return Some(left[i]),
            }
        }
        None
    }
}

fn score_bucket(
    scorer: &SimilarityScorer<'_>,
    snapshot: &SignatureSnapshot,
    memberships: &BucketMemberships,
    index: usize,
    bucket: &CandidateBucket,
) -> BucketResult {
    let mut result = BucketResult {
        edges: Vec::new(),
        diagnostics: Vec::new(),
        pairs: 0,
    };
    let entries: Vec<_> = bucket
        .members
        .iter()
        .filter_map(|&id| snapshot.get(id))
        .collect();

    for (i, a) in entries.iter().enumerate() {
        for b in &entries[i + 1..] {
            if memberships.first_shared(a.record.id, b.record.id) != Some(index) {
                continue;
            }
            result.pairs += 1;
            match scorer.score(a, b) {
                PairOutcome::Scored(score) if score.is_accepted() => result.edges.push(score),
                PairOutcome::Scored(_) | PairOutcome::NoMatch => {}
                PairOutcome::Ambiguous(reason) => {
                    debug!(
                        "Pair ({}, {}) is ambiguous: {}",
                        a.record.id, b.record.id, reason
                    );
                    result
                        .diagnostics
                        .push(Diagnostic::ambiguous(a.record.id, b.record.id, reason));
                }
            }
        }
    }
    result
}

