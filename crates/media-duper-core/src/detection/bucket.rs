use super::score::PairwiseScore;
use crate::config::DetectionConfig;
use crate::model::{FileId, HashAlgorithm, MediaType};
use crate::signature::{SignatureSnapshot, SnapshotEntry};
use ahash::{AHashMap, AHashSet};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Lower clamp for duration ranges; durations are whole milliseconds.
const MIN_DURATION_SECS: f64 = 0.001;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub media_type: MediaType,
    /// Duration window for timed media, 0 for stills.
    pub magnitude_window: i32,
    /// Aspect-ratio window for visual media, 0 for audio.
    pub dimension_window: i32,
    /// Hash band, present only when an oversized bucket was split.
    pub band: Option<HashBand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashBand {
    pub algorithm: HashAlgorithm,
    pub bit_length: u32,
    pub index: u32,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateBucket {
    pub key: BucketKey,
    /// Ascending file ids.
    pub members: Vec<FileId>,
}

/// Files sharing checksum and size. Only the representative enters the
/// perceptual buckets; the rest are grouped through exact edges.
#[derive(Debug, Clone, PartialEq)]
pub struct ExactClass {
    pub checksum: String,
    pub size: u64,
    pub representative: FileId,
    pub members: Vec<FileId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnscoredFile {
    pub file_id: FileId,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct BucketPlan {
    pub exact_classes: Vec<ExactClass>,
    pub buckets: Vec<CandidateBucket>,
    pub unscored: Vec<UnscoredFile>,
}

impl BucketPlan {
    /// Confidence-1.0 edges linking each exact class to its representative.
    pub fn exact_edges(&self) -> Vec<PairwiseScore> {
        self.exact_classes
            .iter()
            .flat_map(|class| {
                class
                    .members
                    .iter()
                    .filter(move |&&member| member != class.representative)
                    .map(move |&member| PairwiseScore::exact(class.representative, member))
            })
            .collect()
    }
}

/// Partitions the file population into bounded comparison buckets.
///
/// Keys are (media type, duration window, aspect-ratio window). Windows are
/// logarithmic. A file joins every window its tolerance range touches: the
/// relative overlap for aspect ratios, and the wider of the relative overlap
/// and `duration_tolerance_secs` for durations. Buckets larger than `max_bucket_size` are
/// split by primary-hash bands: with `k + 1` bands, any two hashes within
/// Hamming distance `k` agree on at least one band, so no pair that could pass
/// the visual floor is lost.
pub struct CandidateBucketer<'a> {
    config: &'a DetectionConfig,
}

impl<'a> CandidateBucketer<'a> {
    pub fn new(config: &'a DetectionConfig) -> Self {
        Self { config }
    }

    pub fn partition(&self, snapshot: &SignatureSnapshot) -> BucketPlan {
        let mut unscored = Vec::new();
        let mut scorable: Vec<&SnapshotEntry> = Vec::new();
        let mut valid: AHashSet<FileId> = AHashSet::new();
        let mut checksum_map: AHashMap<(&str, u64), Vec<FileId>> = AHashMap::new();

        for entry in snapshot.iter() {
            let file_id = entry.record.id;
            if let Some(checksum) = entry.signature.as_ref().and_then(|s| s.checksum.as_deref()) {
                if !checksum.is_empty() {
                    checksum_map
                        .entry((checksum, entry.record.size))
                        .or_default()
                        .push(file_id);
                }
            }
            match validate(entry) {
                Ok(()) => {
                    valid.insert(file_id);
                    scorable.push(entry);
                }
                Err(reason) => unscored.push(UnscoredFile { file_id, reason }),
            }
        }

        let mut exact_classes: Vec<ExactClass> = checksum_map
            .into_iter()
            .filter(|(_, members)| members.len() > 1)
            .map(|((checksum, size), members)| {
                let representative = members
                    .iter()
                    .copied()
                    .find(|id| valid.contains(id))
                    .unwrap_or(members[0]);
                ExactClass {
                    checksum: checksum.to_string(),
                    size,
                    representative,
                    members,
                }
            })
            .collect();
        exact_classes.sort_by_key(|class| class.members[0]);

        let shadowed: AHashSet<FileId> = exact_classes
            .iter()
            .flat_map(|class| {
                class
                    .members
                    .iter()
                    .copied()
                    .filter(move |&member| member != class.representative)
            })
            .collect();

        let mut bucket_map: AHashMap<BucketKey, Vec<FileId>> = AHashMap::new();
        for entry in scorable {
            if shadowed.contains(&entry.record.id) {
                continue;
            }
            for key in self.keys_for(entry) {
                bucket_map.entry(key).or_default().push(entry.record.id);
            }
        }

        let mut keyed: Vec<(BucketKey, Vec<FileId>)> = bucket_map.into_iter().collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let mut buckets = Vec::new();
        for (key, members) in keyed {
            if members.len() < 2 {
                continue;
            }
            if members.len() > self.config.max_bucket_size {
                buckets.extend(self.split_oversized(key, members, snapshot));
            } else {
                buckets.push(CandidateBucket { key, members });
            }
        }

        debug!(
            "Bucketing: {} exact classes, {} buckets, {} unscored",
            exact_classes.len(),
            buckets.len(),
            unscored.len()
        );

        BucketPlan {
            exact_classes,
            buckets,
            unscored,
        }
    }

    fn keys_for(&self, entry: &SnapshotEntry) -> Vec<BucketKey> {
        let Some(signature) = entry.signature.as_ref() else {
            return Vec::new();
        };
        let media_type = entry.record.media_type;
        let overlap = self.config.window_overlap;

        let magnitude = match (media_type.is_timed(), signature.duration_ms) {
            (true, Some(ms)) => {
                let secs = ms as f64 / 1000.0;
                let tolerance = self.config.duration_tolerance_secs;
                let low = (secs * (1.0 - overlap)).min(secs - tolerance);
                let high = (secs * (1.0 + overlap)).max(secs + tolerance);
                windows(
                    low.max(MIN_DURATION_SECS),
                    high,
                    self.config.duration_window_ratio,
                )
            }
            _ => vec![0],
        };
        let dimension = match (media_type.is_visual(), signature.dimensions) {
            (true, Some(dims)) if dims.is_valid() => {
                let aspect = dims.aspect_ratio();
                windows(
                    aspect * (1.0 - overlap),
                    aspect * (1.0 + overlap),
                    self.config.aspect_window_ratio,
                )
            }
            _ => vec![0],
        };

        magnitude
            .iter()
            .flat_map(|&m| {
                dimension.iter().map(move |&d| BucketKey {
                    media_type,
                    magnitude_window: m,
                    dimension_window: d,
                    band: None,
                })
            })
            .collect()
    }

    fn split_oversized(
        &self,
        key: BucketKey,
        members: Vec<FileId>,
        snapshot: &SignatureSnapshot,
    ) -> Vec<CandidateBucket> {
        let mut banded: BTreeMap<HashBand, Vec<FileId>> = BTreeMap::new();
        let mut splittable = true;

        for &file_id in &members {
            let Some(hash) = snapshot
                .get(file_id)
                .and_then(|entry| entry.signature.as_ref())
                .and_then(|sig| sig.primary_hash())
            else {
                continue;
            };
            let bit_length = hash.bit_length;
            let max_distance =
                (bit_length as f64 * (1.0 - self.config.visual_floor) + 1e-9).floor() as u32;
            let bands = max_distance + 1;
            if bands > bit_length {
                splittable = false;
                break;
            }
            for index in 0..bands {
                let start = index * bit_length / bands;
                let end = (index + 1) * bit_length / bands;
                banded
                    .entry(HashBand {
                        algorithm: hash.algorithm,
                        bit_length,
                        index,
                        value: hash.band(start, end),
                    })
                    .or_default()
                    .push(file_id);
            }
        }

        if !splittable {
            warn!(
                "Bucket {:?} has {} members but the visual floor is too low to split it",
                key,
                members.len()
            );
            return vec![CandidateBucket { key, members }];
        }

        let split: Vec<CandidateBucket> = banded
            .into_iter()
            .filter(|(_, members)| members.len() > 1)
            .map(|(band, members)| CandidateBucket {
                key: BucketKey {
                    band: Some(band),
                    ..key.clone()
                },
                members,
            })
            .collect();

        debug!(
            "Split oversized bucket {:?} ({} members) into {} band buckets",
            key,
            members.len(),
            split.len()
        );
        split
    }
}

fn validate(entry: &SnapshotEntry) -> Result<(), String> {
    let signature = entry
        .signature
        .as_ref()
        .ok_or_else(|| "missing signature".to_string())?;
    if signature.perceptual_hashes.is_empty() {
        return Err("no perceptual hash".to_string());
    }
    if let Some(bad) = signature.perceptual_hashes.iter().find(|h| !h.is_valid()) {
        return Err(format!("malformed {} hash", bad.algorithm));
    }
    let media_type = entry.record.media_type;
    if media_type.is_visual() && !signature.dimensions.is_some_and(|d| d.is_valid()) {
        return Err("missing or zero dimensions".to_string());
    }
    if media_type.is_timed() && !signature.duration_ms.is_some_and(|ms| ms > 0) {
        return Err("missing or zero duration".to_string());
    }
    Ok(())
}

/// Every logarithmic window index touched by the range `low..=high`.
fn windows(low: f64, high: f64, ratio: f64) -> Vec<i32> {
    let index = |v: f64| (v.ln() / ratio.ln()).floor() as i32;
    (index(low)..=index(high)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Dimensions, FileRecord, HashFamily, MediaMetadata, PerceptualHash, Signature,
    };
    use std::path::PathBuf;

    const DHASH: HashAlgorithm = HashAlgorithm::new(HashFamily::DHash, 1);

    fn entry(id: FileId, hash: u64, checksum: &str) -> SnapshotEntry {
        SnapshotEntry {
            record: FileRecord {
                id,
                path: PathBuf::from(format!("/m/{}.jpg", id)),
                size: 500,
                created_at: None,
                modified_at: 0,
                media_type: MediaType::Image,
                metadata: MediaMetadata::default(),
            },
            signature: Some(Signature {
                checksum: Some(checksum.to_string()),
                perceptual_hashes: vec![PerceptualHash::from_u64(DHASH, hash)],
                dimensions: Some(Dimensions {
                    width: 300,
                    height: 200,
                }),
                duration_ms: None,
                computed_at: 0,
            }),
        }
    }

    #[test]
    fn test_missing_signature_goes_to_unscored() {
        let mut bare = entry(3, 0, "c");
        bare.signature = None;
        let mut no_dims = entry(4, 0, "d");
        no_dims.signature.as_mut().unwrap().dimensions = None;
        let snapshot = SignatureSnapshot::from_entries(vec![entry(1, 0, "a"), bare, no_dims]);

        let config = DetectionConfig::default();
        let plan = CandidateBucketer::new(&config).partition(&snapshot);
        let ids: Vec<FileId> = plan.unscored.iter().map(|u| u.file_id).collect();
        assert_eq!(ids, vec![3, 4]);
        assert_eq!(plan.unscored[0].reason, "missing signature");
    }

    #[test]
    fn test_exact_class_shadows_all_but_representative() {
        let snapshot = SignatureSnapshot::from_entries(vec![
            entry(1, 10, "same"),
            entry(2, 10, "same"),
            entry(3, 10, "same"),
            entry(4, 11, "other"),
        ]);
        let config = DetectionConfig::default();
        let plan = CandidateBucketer::new(&config).partition(&snapshot);

        assert_eq!(plan.exact_classes.len(), 1);
        assert_eq!(plan.exact_classes[0].representative, 1);
        assert_eq!(plan.exact_classes[0].members, vec![1, 2, 3]);
        assert_eq!(plan.exact_edges().len(), 2);
        assert_eq!(plan.buckets.len(), 1);
        assert_eq!(plan.buckets[0].members, vec![1, 4]);
    }

    fn video(id: FileId, duration_ms: u64) -> SnapshotEntry {
        let mut video = entry(id, 0, &format!("v{}", id));
        video.record.media_type = MediaType::Video;
        if let Some(signature) = video.signature.as_mut() {
            signature.duration_ms = Some(duration_ms);
        }
        video
    }

    fn shares_bucket(plan: &BucketPlan, a: FileId, b: FileId) -> bool {
        plan.buckets
            .iter()
            .any(|bucket| bucket.members.contains(&a) && bucket.members.contains(&b))
    }

    #[test]
    fn test_window_range_covers_boundary() {
        assert_eq!(windows(0.98, 1.02, 2.0), vec![-1, 0]);
        assert_eq!(windows(1.47, 1.53, 2.0), vec![0]);
        assert_eq!(windows(1.9, 8.1, 2.0), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_durations_within_tolerance_share_a_bucket_across_window_edges() {
        let config = DetectionConfig::default();
        let cases = [(15_500, 16_800), (3_900, 4_100), (7_000, 8_900), (1, 1_500)];
        for (a, b) in cases {
            let snapshot = SignatureSnapshot::from_entries(vec![video(1, a), video(2, b)]);
            let plan = CandidateBucketer::new(&config).partition(&snapshot);
            assert!(shares_bucket(&plan, 1, 2), "{}ms vs {}ms", a, b);
        }
    }

    #[test]
    fn test_distant_durations_stay_apart() {
        let config = DetectionConfig::default();
        let snapshot = SignatureSnapshot::from_entries(vec![video(1, 4_000), video(2, 40_000)]);
        let plan = CandidateBucketer::new(&config).partition(&snapshot);
        assert!(!shares_bucket(&plan, 1, 2));
    }

    #[test]
    fn test_oversized_bucket_split_keeps_near_pairs_together() {
        let near_a = 0xDEAD_BEEF_0000_0000;
        let near_b = near_a ^ 0b111;
        let snapshot = SignatureSnapshot::from_entries(vec![
            entry(1, near_a, "a"),
            entry(2, 0x0123_4567_89AB_CDEF, "b"),
            entry(3, 0xFFFF_FFFF_FFFF_FFFF, "c"),
            entry(4, near_b, "d"),
        ]);
        let config = DetectionConfig {
            max_bucket_size: 2,
            ..DetectionConfig::default()
        };
        let plan = CandidateBucketer::new(&config).partition(&snapshot);

        assert!(plan.buckets.iter().all(|b| b.key.band.is_some()));
        assert!(plan
            .buckets
            .iter()
            .any(|b| b.members.contains(&1) && b.members.contains(&4)));
    }
}
