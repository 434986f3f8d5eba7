use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use media_duper_core::detection::{DiagnosticKind, GroupKind, MatchClass};
use media_duper_core::model::{
    Dimensions, FileId, FileRecord, HashAlgorithm, HashFamily, MediaMetadata, MediaType,
    PerceptualHash, Signature,
};
use media_duper_core::signature::{SignatureSnapshot, SnapshotEntry};
use media_duper_core::{
    AppConfig, ConfigProvider, DetectionConfig, DetectionEngine, DuplicateGroup, Error,
    MergeConfig, SilentReporter,
};

const DHASH: HashAlgorithm = HashAlgorithm::new(HashFamily::DHash, 1);
const FRAME: HashAlgorithm = HashAlgorithm::new(HashFamily::Frame, 1);

fn image(id: FileId, path: &str, hash: u64) -> SnapshotEntry {
    SnapshotEntry {
        record: FileRecord {
            id,
            path: PathBuf::from(path),
            size: 10_000 + id as u64,
            created_at: None,
            modified_at: 1_700_000_000,
            media_type: MediaType::Image,
            metadata: MediaMetadata::default(),
        },
        signature: Some(Signature {
            checksum: Some(format!("sha256-{}", id)),
            perceptual_hashes: vec![PerceptualHash::from_u64(DHASH, hash)],
            dimensions: Some(Dimensions {
                width: 4000,
                height: 3000,
            }),
            duration_ms: None,
            computed_at: 1_700_000_000,
        }),
    }
}

fn video(id: FileId, path: &str, frames: &[u64], duration_ms: u64) -> SnapshotEntry {
    let mut entry = image(id, path, 0);
    entry.record.media_type = MediaType::Video;
    if let Some(signature) = entry.signature.as_mut() {
        signature.perceptual_hashes = frames
            .iter()
            .map(|f| PerceptualHash::from_u64(FRAME, *f))
            .collect();
        signature.duration_ms = Some(duration_ms);
        signature.dimensions = Some(Dimensions {
            width: 1920,
            height: 1080,
        });
    }
    entry
}

fn exact_copy(mut entry: SnapshotEntry, of: &SnapshotEntry) -> SnapshotEntry {
    entry.record.size = of.record.size;
    if let (Some(sig), Some(original)) = (entry.signature.as_mut(), of.signature.as_ref()) {
        sig.checksum = original.checksum.clone();
    }
    entry
}

fn detect(entries: Vec<SnapshotEntry>) -> media_duper_core::DetectionReport {
    let snapshot = SignatureSnapshot::from_entries(entries);
    let engine = DetectionEngine::new(DetectionConfig::default());
    let mut sink = |_: &DuplicateGroup| {};
    engine.detect(&snapshot, &mut sink, &SilentReporter).unwrap()
}

#[test]
fn test_exact_copies_group_without_hash_comparisons() {
    let a = image(1, "/photos/a.jpg", 0x0F0F);
    // Perceptual hashes disagree completely; the checksum alone decides.
    let b = exact_copy(image(2, "/backup/b.jpg", u64::MAX), &a);

    let report = detect(vec![a, b]);
    assert_eq!(report.groups.len(), 1);
    let group = &report.groups[0];
    assert_eq!(group.file_ids(), vec![1, 2]);
    assert_eq!(group.kind, GroupKind::Exact);
    assert_eq!(group.confidence, 1.0);
    assert_eq!(report.stats.hash_comparisons, 0);
    assert_eq!(report.stats.exact_classes, 1);
}

#[test]
fn test_three_exact_copies_form_one_group() {
    let a = image(1, "/photos/a.jpg", 1);
    let b = exact_copy(image(2, "/photos/b.jpg", 1), &a);
    let c = exact_copy(image(3, "/photos/c.jpg", 1), &a);

    let report = detect(vec![c, a, b]);
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].file_ids(), vec![1, 2, 3]);
    assert!(!report.groups[0].needs_manual_split);
    assert_eq!(report.stats.hash_comparisons, 0);
}

#[test]
fn test_near_duplicate_images_with_matching_dates_are_duplicates() {
    let mut a = image(1, "/photos/IMG_2041.jpg", 0xFFFF_0000_FFFF_0000);
    let mut b = image(2, "/photos/holiday.jpg", 0xFFFF_0000_FFFF_0007);
    a.record.metadata.capture_date = Some(1_650_000_000);
    b.record.metadata.capture_date = Some(1_650_000_000);

    let report = detect(vec![a, b]);
    assert_eq!(report.groups.len(), 1);
    let group = &report.groups[0];
    assert_eq!(group.kind, GroupKind::Duplicate);
    assert!(group.confidence >= 0.85, "confidence {}", group.confidence);
    assert_eq!(group.edges[0].distances.hamming, Some(3));
    assert_eq!(report.stats.hash_comparisons, 1);
}

#[test]
fn test_video_duration_mismatch_is_similar_not_duplicate() {
    let frames = [0xAAAA_AAAA_AAAA_AAAA, 0x5555_5555_5555_5555, 0x0F0F_0F0F_0F0F_0F0F];
    let a = video(1, "/videos/clip.mp4", &frames, 10_000);
    let b = video(2, "/videos/clip (2).mp4", &frames, 14_000);

    let report = detect(vec![a, b]);
    assert_eq!(report.groups.len(), 1);
    let group = &report.groups[0];
    assert_eq!(group.kind, GroupKind::Similar);
    assert_eq!(group.edges[0].class, MatchClass::Similar);
    assert!(group.edges[0].duration_mismatch);
}

#[test]
fn test_videos_within_duration_tolerance_meet_across_window_edges() {
    let frames = [0x1234_5678_9ABC_DEF0, 0x0FED_CBA9_8765_4321];
    // Each pair straddles a power-of-two window edge but differs by under 2s.
    for (a_ms, b_ms) in [(15_500, 16_800), (3_900, 4_100)] {
        let a = video(1, "/videos/party.mp4", &frames, a_ms);
        let b = video(2, "/videos/party (2).mp4", &frames, b_ms);

        let report = detect(vec![a, b]);
        assert_eq!(report.groups.len(), 1, "{}ms vs {}ms", a_ms, b_ms);
        assert_eq!(report.groups[0].file_ids(), vec![1, 2]);
        assert!(!report.groups[0].edges[0].duration_mismatch);
        assert_eq!(report.stats.candidate_pairs, 1);
        assert_eq!(report.stats.hash_comparisons, 1);
    }
}

#[test]
fn test_pair_sharing_several_buckets_is_scored_once() {
    let frames = [0x1234_5678_9ABC_DEF0, 0x0FED_CBA9_8765_4321];
    // Both durations reach into the 8-16s and 16-32s windows.
    let a = video(1, "/videos/party.mp4", &frames, 15_500);
    let b = video(2, "/videos/party (2).mp4", &frames, 15_900);

    let report = detect(vec![a, b]);
    assert!(report.stats.buckets >= 2);
    assert_eq!(report.stats.candidate_pairs, 1);
    assert_eq!(report.stats.hash_comparisons, 1);
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].edges.len(), 1);
}

#[test]
fn test_distant_images_are_not_grouped() {
    let a = image(1, "/photos/a.jpg", 0);
    let b = image(2, "/photos/b.jpg", u64::MAX);

    let report = detect(vec![a, b]);
    assert!(report.groups.is_empty());
    assert_eq!(report.stats.candidate_pairs, 1);
}

#[test]
fn test_transitive_chain_is_one_group_flagged_for_manual_split() {
    // a-b and b-c are 12 bits apart; a-c is 24 bits apart, below the visual floor.
    let a = image(1, "/one/sunset.jpg", 0);
    let b = image(2, "/two/sunset.jpg", 0xFFF);
    let c = image(3, "/three/sunset.jpg", 0xFF_FFFF);

    let report = detect(vec![a, b, c]);
    assert_eq!(report.groups.len(), 1);
    let group = &report.groups[0];
    assert_eq!(group.file_ids(), vec![1, 2, 3]);
    assert_eq!(group.edges.len(), 2);
    assert!(group.needs_manual_split);
    assert_eq!(group.divergent_pairs.len(), 1);
    assert_eq!((group.divergent_pairs[0].0, group.divergent_pairs[0].1), (1, 3));
    assert_eq!(report.stats.flagged_groups, 1);
}

#[test]
fn test_group_confidence_is_weakest_link() {
    let a = image(1, "/one/sunset.jpg", 0);
    let b = image(2, "/two/sunset.jpg", 0xFFF);
    let c = image(3, "/three/sunset.jpg", 0xFF_FFFF);

    let report = detect(vec![a, b, c]);
    let group = &report.groups[0];
    let weakest = group
        .edges
        .iter()
        .map(|e| e.confidence)
        .fold(f64::INFINITY, f64::min);
    assert_eq!(group.confidence, weakest);
}

#[test]
fn test_missing_signature_is_unscored_not_fatal() {
    let a = image(1, "/photos/a.jpg", 7);
    let b = image(2, "/photos/a copy.jpg", 7);
    let mut c = image(3, "/photos/broken.jpg", 7);
    c.signature = None;

    let report = detect(vec![a, b, c]);
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].file_ids(), vec![1, 2]);
    assert_eq!(report.unscored.len(), 1);
    assert_eq!(report.unscored[0].file_id, 3);
    assert!(report
        .diagnostics
        .iter()
        .any(|d| d.file_id == 3 && d.kind == DiagnosticKind::Unscored));
}

#[test]
fn test_detection_is_deterministic_across_runs() {
    let entries = || {
        vec![
            image(5, "/a/beach.jpg", 0x00FF),
            image(3, "/b/beach.jpg", 0x00FE),
            image(9, "/c/forest.jpg", 0xFFFF_FFFF_0000_0000),
            image(1, "/d/forest.jpg", 0xFFFF_FFFF_0000_0001),
            image(7, "/e/lonely.jpg", 0x5555_5555_5555_5555),
        ]
    };

    let first = detect(entries());
    let second = detect(entries().into_iter().rev().collect());
    assert_eq!(first.groups, second.groups);
    let members: Vec<Vec<FileId>> = first.groups.iter().map(|g| g.file_ids()).collect();
    assert_eq!(members, vec![vec![1, 9], vec![3, 5]]);
}

#[test]
fn test_every_file_lands_in_at_most_one_group() {
    let report = detect(vec![
        image(1, "/a/x.jpg", 0),
        image(2, "/b/x.jpg", 0x1),
        image(3, "/c/x.jpg", 0x3),
        image(4, "/d/y.jpg", 0xFFFF_FFFF_FFFF_0000),
        image(5, "/e/y.jpg", 0xFFFF_FFFF_FFFF_0001),
    ]);
    let mut seen = Vec::new();
    for group in &report.groups {
        for id in group.file_ids() {
            assert!(!seen.contains(&id), "file {} in two groups", id);
            seen.push(id);
        }
    }
    assert_eq!(report.groups.len(), 2);
}

#[test]
fn test_cancelled_detection_returns_cancelled() {
    let snapshot = SignatureSnapshot::from_entries(vec![
        image(1, "/a/x.jpg", 0),
        image(2, "/b/x.jpg", 1),
    ]);
    let engine = DetectionEngine::new(DetectionConfig::default());
    engine
        .cancel_token()
        .store(true, std::sync::atomic::Ordering::Relaxed);
    let mut sink = |_: &DuplicateGroup| {};
    let result = engine.detect(&snapshot, &mut sink, &SilentReporter);
    assert!(matches!(result, Err(media_duper_core::Error::Cancelled)));
}

#[test]
fn test_groups_stream_to_sink_as_finalised() {
    let snapshot = SignatureSnapshot::from_entries(vec![
        image(1, "/a/x.jpg", 0),
        image(2, "/b/x.jpg", 1),
        image(3, "/c/z.jpg", 0xFFFF_FFFF_FFFF_FFFF),
        image(4, "/d/z.jpg", 0xFFFF_FFFF_FFFF_FFFE),
    ]);
    let engine = DetectionEngine::new(DetectionConfig::default());
    let mut streamed: Vec<Vec<FileId>> = Vec::new();
    let mut sink = |group: &DuplicateGroup| streamed.push(group.file_ids());
    let report = engine.detect(&snapshot, &mut sink, &SilentReporter).unwrap();

    assert_eq!(streamed, vec![vec![1, 2], vec![3, 4]]);
    assert_eq!(report.groups.len(), 2);
}

/// Settings that can be changed between runs.
#[derive(Default)]
struct LiveSettings(Mutex<AppConfig>);

impl ConfigProvider for LiveSettings {
    fn detection_config(&self) -> DetectionConfig {
        self.0.lock().unwrap().detection.clone()
    }

    fn merge_config(&self) -> MergeConfig {
        self.0.lock().unwrap().merge.clone()
    }
}

#[test]
fn test_provider_overrides_apply_to_the_next_run() {
    let settings = Arc::new(LiveSettings::default());
    let engine = DetectionEngine::with_provider(settings.clone());
    let entries = || {
        vec![
            image(1, "/photos/IMG_2041.jpg", 0xFFFF_0000_FFFF_0000),
            image(2, "/photos/IMG_2041 (2).jpg", 0xFFFF_0000_FFFF_0007),
        ]
    };
    let run = |engine: &DetectionEngine| {
        let snapshot = SignatureSnapshot::from_entries(entries());
        let mut sink = |_: &DuplicateGroup| {};
        engine.detect(&snapshot, &mut sink, &SilentReporter)
    };

    assert_eq!(run(&engine).unwrap().groups.len(), 1);

    // Only identical hashes pass the visual gate now.
    settings.0.lock().unwrap().detection.visual_floor = 1.0;
    assert_eq!(engine.current_config().visual_floor, 1.0);
    assert!(run(&engine).unwrap().groups.is_empty());

    settings.0.lock().unwrap().detection.similar_threshold = 0.99;
    assert!(matches!(run(&engine), Err(Error::Config(_))));
}
