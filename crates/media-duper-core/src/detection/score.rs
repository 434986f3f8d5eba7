use crate::config::DetectionConfig;
use crate::model::{FileId, Signature};
use crate::signature::SnapshotEntry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchClass {
    Duplicate,
    /// Needs review before merging.
    Similar,
    Discarded,
}

impl MatchClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchClass::Duplicate => "duplicate",
            MatchClass::Similar => "similar",
            MatchClass::Discarded => "discarded",
        }
    }
}

/// Evidence signals, in the order they are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Checksum,
    Visual,
    CaptureDate,
    Filename,
}

/// One entry of the evidence contract: how much a signal moved the score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalContribution {
    pub signal: Signal,
    /// Normalised sub-score in [0, 1].
    pub sub_score: f64,
    /// Weight after renormalising over the signals both files carry.
    pub weight: f64,
    pub contribution: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyKind {
    Dimension,
    Aspect,
    Duration,
    FrameCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Penalty {
    pub kind: PenaltyKind,
    pub factor: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDistances {
    /// Hamming distance between the primary hashes.
    pub hamming: Option<u32>,
    pub bit_length: Option<u32>,
    pub frames_compared: u32,
    pub capture_delta_secs: Option<i64>,
    pub duration_delta_ms: Option<u64>,
    /// Smaller pixel count over larger.
    pub pixel_ratio: Option<f64>,
    pub aspect_delta: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseScore {
    /// Always the smaller id of the pair.
    pub file_a: FileId,
    pub file_b: FileId,
    pub confidence: f64,
    pub class: MatchClass,
    pub exact: bool,
    pub contributions: Vec<SignalContribution>,
    pub penalties: Vec<Penalty>,
    pub distances: RawDistances,
    /// Durations differ beyond tolerance; the pair can never be a duplicate.
    pub duration_mismatch: bool,
}

impl PairwiseScore {
    pub fn exact(file_a: FileId, file_b: FileId) -> Self {
        let (file_a, file_b) = ordered(file_a, file_b);
        Self {
            file_a,
            file_b,
            confidence: 1.0,
            class: MatchClass::Duplicate,
            exact: true,
            contributions: vec![SignalContribution {
                signal: Signal::Checksum,
                sub_score: 1.0,
                weight: 1.0,
                contribution: 1.0,
            }],
            penalties: Vec::new(),
            distances: RawDistances::default(),
            duration_mismatch: false,
        }
    }

    pub fn pair(&self) -> (FileId, FileId) {
        (self.file_a, self.file_b)
    }

    pub fn is_accepted(&self) -> bool {
        self.class != MatchClass::Discarded
    }

    pub fn other(&self, file_id: FileId) -> FileId {
        if self.file_a == file_id {
            self.file_b
        } else {
            self.file_a
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    Scored(PairwiseScore),
    NoMatch,
    /// Hashes from different families or versions; never guessed into a match.
    Ambiguous(String),
}

impl PairOutcome {
    /// Confidence of the outcome, 0 for no-match and ambiguity.
    pub fn confidence(&self) -> f64 {
        match self {
            PairOutcome::Scored(score) => score.confidence,
            _ => 0.0,
        }
    }
}

struct VisualEvidence {
    score: f64,
    primary_distance: u32,
    bit_length: u32,
    frames: u32,
    frame_count_mismatch: bool,
}

/// Combines checksum, perceptual, metadata and structural signals into a
/// confidence score for a candidate pair.
pub struct SimilarityScorer<'a> {
    config: &'a DetectionConfig,
    hash_comparisons: AtomicU64,
}

impl<'a> SimilarityScorer<'a> {
    pub fn new(config: &'a DetectionConfig) -> Self {
        Self {
            config,
            hash_comparisons: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        self.config
    }

    /// Number of perceptual hash comparisons performed so far.
    pub fn hash_comparisons(&self) -> u64 {
        self.hash_comparisons.load(Ordering::Relaxed)
    }

    pub fn classify(&self, confidence: f64) -> MatchClass {
        if confidence >= self.config.duplicate_threshold {
            MatchClass::Duplicate
        } else if confidence >= self.config.similar_threshold {
            MatchClass::Similar
        } else {
            MatchClass::Discarded
        }
    }

    pub fn score(&self, a: &SnapshotEntry, b: &SnapshotEntry) -> PairOutcome {
        let (a, b) = if a.record.id <= b.record.id { (a, b) } else { (b, a) };
        let (sig_a, sig_b) = match (&a.signature, &b.signature) {
            (Some(sig_a), Some(sig_b)) => (sig_a, sig_b),
            _ => return PairOutcome::NoMatch,
        };

        if is_exact(a, sig_a, b, sig_b) {
            return PairOutcome::Scored(PairwiseScore::exact(a.record.id, b.record.id));
        }

        if a.record.media_type != b.record.media_type {
            return PairOutcome::NoMatch;
        }

        let visual = match self.visual_similarity(sig_a, sig_b) {
            Ok(Some(visual)) => visual,
            Ok(None) => return PairOutcome::NoMatch,
            Err(reason) => return PairOutcome::Ambiguous(reason),
        };

        let mut distances = RawDistances {
            hamming: Some(visual.primary_distance),
            bit_length: Some(visual.bit_length),
            frames_compared: visual.frames,
            ..RawDistances::default()
        };

        let weights = &self.config.weights;
        let mut signals = vec![(Signal::Visual, visual.score, weights.visual)];
        if let (Some(date_a), Some(date_b)) = (
            a.record.metadata.capture_date,
            b.record.metadata.capture_date,
        ) {
            let delta = (date_a - date_b).abs();
            distances.capture_delta_secs = Some(delta);
            signals.push((
                Signal::CaptureDate,
                self.date_proximity(delta),
                weights.capture_date,
            ));
        }
        signals.push((
            Signal::Filename,
            filename_similarity(&a.record.file_name(), &b.record.file_name()),
            weights.filename,
        ));

        let total_weight: f64 = signals.iter().map(|(_, _, w)| w).sum();
        let contributions: Vec<SignalContribution> = signals
            .into_iter()
            .map(|(signal, sub_score, weight)| {
                let weight = weight / total_weight;
                SignalContribution {
                    signal,
                    sub_score,
                    weight,
                    contribution: sub_score * weight,
                }
            })
            .collect();
        let base: f64 = contributions.iter().map(|c| c.contribution).sum();

        let (penalties, duration_mismatch) =
            self.structural_penalties(a, sig_a, sig_b, &visual, &mut distances);
        let factor: f64 = penalties.iter().map(|p| p.factor).product();
        let confidence = (base * factor).clamp(0.0, 1.0);

        if confidence < self.config.admission_floor {
            return PairOutcome::NoMatch;
        }

        let mut class = self.classify(confidence);
        if duration_mismatch && class == MatchClass::Duplicate {
            class = MatchClass::Similar;
        }

        PairOutcome::Scored(PairwiseScore {
            file_a: a.record.id,
            file_b: b.record.id,
            confidence,
            class,
            exact: false,
            contributions,
            penalties,
            distances,
            duration_mismatch,
        })
    }

    fn visual_similarity(
        &self,
        a: &Signature,
        b: &Signature,
    ) -> Result<Option<VisualEvidence>, String> {
        let frames = a.perceptual_hashes.len().min(b.perceptual_hashes.len());
        if frames == 0 {
            return Ok(None);
        }

        let pairs = a.perceptual_hashes.iter().zip(&b.perceptual_hashes);
        for (hash_a, hash_b) in pairs.clone() {
            if hash_a.algorithm != hash_b.algorithm || hash_a.bit_length != hash_b.bit_length {
                return Err(format!(
                    "{} ({} bits) vs {} ({} bits)",
                    hash_a.algorithm, hash_a.bit_length, hash_b.algorithm, hash_b.bit_length
                ));
            }
        }

        self.hash_comparisons.fetch_add(1, Ordering::Relaxed);

        let mut total = 0.0;
        let mut primary_distance = 0;
        let mut bit_length = 0;
        for (i, (hash_a, hash_b)) in pairs.enumerate() {
            let similarity = hash_a
                .similarity(hash_b)
                .ok_or_else(|| format!("malformed {} hash", hash_a.algorithm))?;
            if i == 0 {
                if similarity < self.config.visual_floor {
                    return Ok(None);
                }
                primary_distance = hash_a.hamming_distance(hash_b).unwrap_or_default();
                bit_length = hash_a.bit_length;
            }
            total += similarity;
        }

        Ok(Some(VisualEvidence {
            score: total / frames as f64,
            primary_distance,
            bit_length,
            frames: frames as u32,
            frame_count_mismatch: a.perceptual_hashes.len() != b.perceptual_hashes.len(),
        }))
    }

    fn date_proximity(&self, delta_secs: i64) -> f64 {
        let tolerance = self.config.capture_date_tolerance_secs;
        if delta_secs <= tolerance {
            return 1.0;
        }
        if self.config.capture_date_decay_secs <= 0.0 {
            return 0.0;
        }
        (-((delta_secs - tolerance) as f64) / self.config.capture_date_decay_secs).exp()
    }

    fn structural_penalties(
        &self,
        a: &SnapshotEntry,
        sig_a: &Signature,
        sig_b: &Signature,
        visual: &VisualEvidence,
        distances: &mut RawDistances,
    ) -> (Vec<Penalty>, bool) {
        let factors = &self.config.penalties;
        let media_type = a.record.media_type;
        let mut penalties = Vec::new();
        let mut duration_mismatch = false;

        if media_type.is_visual() {
            if let (Some(dims_a), Some(dims_b)) = (sig_a.dimensions, sig_b.dimensions) {
                if dims_a.is_valid() && dims_b.is_valid() {
                    let (ar_a, ar_b) = (dims_a.aspect_ratio(), dims_b.aspect_ratio());
                    let aspect_delta = (ar_a - ar_b).abs() / ar_a.max(ar_b);
                    distances.aspect_delta = Some(aspect_delta);
                    if aspect_delta > self.config.aspect_tolerance {
                        penalties.push(Penalty {
                            kind: PenaltyKind::Aspect,
                            factor: factors.aspect,
                        });
                    }

                    let (px_a, px_b) = (dims_a.pixels(), dims_b.pixels());
                    let pixel_ratio = px_a.min(px_b) as f64 / px_a.max(px_b) as f64;
                    distances.pixel_ratio = Some(pixel_ratio);
                    if 1.0 - pixel_ratio > self.config.dimension_tolerance {
                        penalties.push(Penalty {
                            kind: PenaltyKind::Dimension,
                            factor: factors.dimension,
                        });
                    }
                }
            }
        }

        if media_type.is_timed() {
            if let (Some(dur_a), Some(dur_b)) = (sig_a.duration_ms, sig_b.duration_ms) {
                let delta = dur_a.abs_diff(dur_b);
                distances.duration_delta_ms = Some(delta);
                if delta as f64 > self.config.duration_tolerance_secs * 1000.0 {
                    duration_mismatch = true;
                    penalties.push(Penalty {
                        kind: PenaltyKind::Duration,
                        factor: factors.duration,
                    });
                }
            }
        }

        if visual.frame_count_mismatch {
            penalties.push(Penalty {
                kind: PenaltyKind::FrameCount,
                factor: factors.frame_count,
            });
        }

        (penalties, duration_mismatch)
    }
}

fn ordered(a: FileId, b: FileId) -> (FileId, FileId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn is_exact(a: &SnapshotEntry, sig_a: &Signature, b: &SnapshotEntry, sig_b: &Signature) -> bool {
    match (&sig_a.checksum, &sig_b.checksum) {
        (Some(sum_a), Some(sum_b)) => sum_a == sum_b && a.record.size == b.record.size,
        _ => false,
    }
}

const COPY_SUFFIXES: [&str; 4] = [" - copy", " copy", "-copy", "_copy"];

/// Lowercased file stem with trailing copy markers (" copy", " (2)") removed.
fn normalized_stem(name: &str) -> String {
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    let mut stem = stem.to_lowercase();
    loop {
        let trimmed = stem.trim_end();
        if let Some(rest) = strip_counter(trimmed) {
            stem = rest.to_string();
            continue;
        }
        if let Some(suffix) = COPY_SUFFIXES.iter().find(|s| trimmed.ends_with(*s)) {
            stem = trimmed[..trimmed.len() - suffix.len()].to_string();
            continue;
        }
        return trimmed.to_string();
    }
}

fn strip_counter(s: &str) -> Option<&str> {
    let inner = s.strip_suffix(')')?;
    let (prefix, digits) = inner.rsplit_once('(')?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) || prefix.is_empty() {
        return None;
    }
    Some(prefix.trim_end())
}

/// Normalised Levenshtein similarity of the two file stems.
pub fn filename_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = normalized_stem(a).chars().collect();
    let b: Vec<char> = normalized_stem(b).chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    1.0 - previous[b.len()] as f64 / longest as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Dimensions, FileRecord, HashAlgorithm, HashFamily, MediaMetadata, MediaType,
        PerceptualHash,
    };
    use std::path::PathBuf;

    const DHASH: HashAlgorithm = HashAlgorithm::new(HashFamily::DHash, 1);
    const FRAME: HashAlgorithm = HashAlgorithm::new(HashFamily::Frame, 1);

    fn image(id: FileId, name: &str, hash: u64, dims: (u32, u32)) -> SnapshotEntry {
        SnapshotEntry {
            record: FileRecord {
                id,
                path: PathBuf::from(format!("/photos/{}", name)),
                size: 1000 + id as u64,
                created_at: None,
                modified_at: 1_700_000_000,
                media_type: MediaType::Image,
                metadata: MediaMetadata::default(),
            },
            signature: Some(Signature {
                checksum: Some(format!("sum-{}", id)),
                perceptual_hashes: vec![PerceptualHash::from_u64(DHASH, hash)],
                dimensions: Some(Dimensions {
                    width: dims.0,
                    height: dims.1,
                }),
                duration_ms: None,
                computed_at: 1_700_000_000,
            }),
        }
    }

    fn video(id: FileId, name: &str, frames: &[u64], duration_ms: u64) -> SnapshotEntry {
        let mut entry = image(id, name, 0, (1920, 1080));
        entry.record.media_type = MediaType::Video;
        let sig = entry.signature.as_mut().unwrap();
        sig.perceptual_hashes = frames
            .iter()
            .map(|f| PerceptualHash::from_u64(FRAME, *f))
            .collect();
        sig.duration_ms = Some(duration_ms);
        entry
    }

    fn scored(outcome: PairOutcome) -> PairwiseScore {
        match outcome {
            PairOutcome::Scored(score) => score,
            other => panic!("expected a score, got {:?}", other),
        }
    }

    #[test]
    fn test_threshold_boundary() {
        let config = DetectionConfig::default();
        let scorer = SimilarityScorer::new(&config);
        assert_eq!(scorer.classify(0.85), MatchClass::Duplicate);
        assert_eq!(scorer.classify(0.85 - 1e-9), MatchClass::Similar);
        assert_eq!(scorer.classify(0.60), MatchClass::Similar);
        assert_eq!(scorer.classify(0.60 - 1e-9), MatchClass::Discarded);
    }

    #[test]
    fn test_exact_checksum_short_circuits() {
        let config = DetectionConfig::default();
        let scorer = SimilarityScorer::new(&config);
        let a = image(1, "a.jpg", 0, (100, 100));
        let mut b = image(2, "b.jpg", u64::MAX, (100, 100));
        b.record.size = a.record.size;
        b.signature.as_mut().unwrap().checksum = a.signature.as_ref().unwrap().checksum.clone();

        let score = scored(scorer.score(&b, &a));
        assert!(score.exact);
        assert_eq!(score.confidence, 1.0);
        assert_eq!(score.pair(), (1, 2));
        assert_eq!(scorer.hash_comparisons(), 0);
    }

    #[test]
    fn test_checksum_match_with_size_mismatch_is_not_exact() {
        let config = DetectionConfig::default();
        let scorer = SimilarityScorer::new(&config);
        let a = image(1, "a.jpg", 7, (100, 100));
        let mut b = image(2, "a.jpg", 7, (100, 100));
        b.signature.as_mut().unwrap().checksum = a.signature.as_ref().unwrap().checksum.clone();

        let score = scored(scorer.score(&a, &b));
        assert!(!score.exact);
        assert_eq!(scorer.hash_comparisons(), 1);
    }

    #[test]
    fn test_three_bit_dhash_difference_with_matching_dates_is_duplicate() {
        let config = DetectionConfig::default();
        let scorer = SimilarityScorer::new(&config);
        let mut a = image(1, "IMG_2041.jpg", 0xFFFF_0000_FFFF_0000, (4000, 3000));
        let mut b = image(2, "holiday.jpg", 0xFFFF_0000_FFFF_0007, (4000, 3000));
        a.record.metadata.capture_date = Some(1_650_000_000);
        b.record.metadata.capture_date = Some(1_650_000_000);

        let score = scored(scorer.score(&a, &b));
        let visual = score
            .contributions
            .iter()
            .find(|c| c.signal == Signal::Visual)
            .unwrap();
        assert!((visual.sub_score - (1.0 - 3.0 / 64.0)).abs() < 1e-9);
        assert_eq!(score.distances.hamming, Some(3));
        assert!(score.confidence >= 0.85, "confidence {}", score.confidence);
        assert_eq!(score.class, MatchClass::Duplicate);
    }

    #[test]
    fn test_duration_mismatch_caps_video_at_similar() {
        let config = DetectionConfig::default();
        let scorer = SimilarityScorer::new(&config);
        let frames = [0xAAAA_AAAA_AAAA_AAAA, 0x5555_5555_5555_5555, 0x0F0F_0F0F_0F0F_0F0F];
        let a = video(1, "clip.mp4", &frames, 10_000);
        let b = video(2, "clip.mp4", &frames, 14_000);

        let score = scored(scorer.score(&a, &b));
        assert!(score.duration_mismatch);
        assert_eq!(score.distances.duration_delta_ms, Some(4_000));
        assert_eq!(score.class, MatchClass::Similar);
        assert!(score
            .penalties
            .iter()
            .any(|p| p.kind == PenaltyKind::Duration));
    }

    #[test]
    fn test_cross_algorithm_comparison_is_ambiguous() {
        let config = DetectionConfig::default();
        let scorer = SimilarityScorer::new(&config);
        let a = image(1, "a.jpg", 42, (100, 100));
        let mut b = image(2, "a.jpg", 42, (100, 100));
        b.signature.as_mut().unwrap().perceptual_hashes[0].algorithm =
            HashAlgorithm::new(HashFamily::DHash, 2);

        match scorer.score(&a, &b) {
            PairOutcome::Ambiguous(reason) => assert!(reason.contains("dhash-v2")),
            other => panic!("expected ambiguity, got {:?}", other),
        }
        assert_eq!(scorer.hash_comparisons(), 0);
    }

    #[test]
    fn test_resized_image_is_penalised_not_rejected() {
        let config = DetectionConfig::default();
        let scorer = SimilarityScorer::new(&config);
        let a = image(1, "sunset.jpg", 99, (4000, 3000));
        let b = image(2, "sunset.jpg", 99, (1600, 1200));

        let score = scored(scorer.score(&a, &b));
        assert_eq!(score.penalties.len(), 1);
        assert_eq!(score.penalties[0].kind, PenaltyKind::Dimension);
        assert_eq!(score.class, MatchClass::Duplicate);
    }

    #[test]
    fn test_distant_hashes_are_no_match() {
        let config = DetectionConfig::default();
        let scorer = SimilarityScorer::new(&config);
        let a = image(1, "a.jpg", 0, (100, 100));
        let b = image(2, "a.jpg", u64::MAX, (100, 100));
        assert_eq!(scorer.score(&a, &b), PairOutcome::NoMatch);
    }

    #[test]
    fn test_contributions_are_ordered_and_sum_to_base() {
        let config = DetectionConfig::default();
        let scorer = SimilarityScorer::new(&config);
        let mut a = image(1, "a.jpg", 1, (100, 100));
        let mut b = image(2, "b.jpg", 1, (100, 100));
        a.record.metadata.capture_date = Some(0);
        b.record.metadata.capture_date = Some(7200);

        let score = scored(scorer.score(&a, &b));
        let signals: Vec<Signal> = score.contributions.iter().map(|c| c.signal).collect();
        assert_eq!(
            signals,
            vec![Signal::Visual, Signal::CaptureDate, Signal::Filename]
        );
        let total: f64 = score.contributions.iter().map(|c| c.contribution).sum();
        assert!((total - score.confidence).abs() < 1e-9);
    }

    #[test]
    fn test_filename_similarity_ignores_copy_markers() {
        assert_eq!(filename_similarity("IMG_0001.JPG", "img_0001 (2).jpg"), 1.0);
        assert_eq!(filename_similarity("beach.png", "beach copy.png"), 1.0);
        assert!(filename_similarity("IMG_0001.jpg", "IMG_0002.jpg") < 1.0);
        assert_eq!(filename_similarity("", ""), 1.0);
    }
}
