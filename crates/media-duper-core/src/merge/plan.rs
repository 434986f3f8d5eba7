use super::fsops;
use crate::error::{Error, PlanningError};
use crate::model::{FileId, FileRecord, GroupId, GroupStatus, MediaMetadata, Signature};
use crate::signature::FileLocator;
use crate::storage::Database;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;
use tracing::{debug, info};

/// A file as observed on disk when the plan was made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedFile {
    pub file_id: FileId,
    pub path: PathBuf,
    pub size: u64,
    pub modified_at: i64,
    /// Hex blake3 digest, checked again before execution.
    pub digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataField {
    Keywords,
    CaptureDate,
    Gps,
    Camera,
    Technical,
}

impl MetadataField {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataField::Keywords => "keywords",
            MetadataField::CaptureDate => "capture_date",
            MetadataField::Gps => "gps",
            MetadataField::Camera => "camera",
            MetadataField::Technical => "technical",
        }
    }
}

/// A keeper field taken from, or extended by, other members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMerge {
    pub field: MetadataField,
    pub sources: Vec<FileId>,
    pub value: String,
}

/// Proposed resolution of one group. Building a plan changes nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    pub group_id: GroupId,
    pub keeper: PlannedFile,
    pub removals: Vec<PlannedFile>,
    /// Keeper catalog metadata before merging.
    pub keeper_metadata: MediaMetadata,
    pub merged_metadata: MediaMetadata,
    pub field_merges: Vec<FieldMerge>,
    pub created_at: DateTime<Utc>,
}

impl MergePlan {
    pub fn removal_ids(&self) -> Vec<FileId> {
        self.removals.iter().map(|f| f.file_id).collect()
    }

    pub fn reclaimed_bytes(&self) -> u64 {
        self.removals.iter().map(|f| f.size).sum()
    }
}

#[derive(Debug, Clone)]
pub struct KeeperCandidate {
    pub record: FileRecord,
    pub signature: Option<Signature>,
}

impl KeeperCandidate {
    fn pixels(&self) -> u64 {
        self.signature
            .as_ref()
            .and_then(|s| s.dimensions)
            .map(|d| d.pixels())
            .unwrap_or(0)
    }

    fn duration_ms(&self) -> u64 {
        self.signature
            .as_ref()
            .and_then(|s| s.duration_ms)
            .unwrap_or(0)
    }

    fn bitrate(&self) -> u32 {
        self.record
            .metadata
            .technical
            .as_ref()
            .and_then(|t| t.bitrate_kbps)
            .unwrap_or(0)
    }

    fn origin_time(&self) -> i64 {
        self.record.created_at.unwrap_or(self.record.modified_at)
    }
}

/// Keeper preference: fidelity, then size, then metadata completeness, then
/// the earliest origin date. Name and id make the order total.
pub fn keeper_order(a: &KeeperCandidate, b: &KeeperCandidate) -> Ordering {
    b.pixels()
        .cmp(&a.pixels())
        .then_with(|| b.duration_ms().cmp(&a.duration_ms()))
        .then_with(|| b.bitrate().cmp(&a.bitrate()))
        .then_with(|| b.record.size.cmp(&a.record.size))
        .then_with(|| {
            b.record
                .metadata
                .completeness()
                .cmp(&a.record.metadata.completeness())
        })
        .then_with(|| a.origin_time().cmp(&b.origin_time()))
        .then_with(|| a.record.file_name().cmp(&b.record.file_name()))
        .then_with(|| a.record.id.cmp(&b.record.id))
}

/// Merges member metadata onto the first (keeper) candidate.
pub fn merge_metadata(ranked: &[KeeperCandidate]) -> (MediaMetadata, Vec<FieldMerge>) {
    let Some(keeper) = ranked.first() else {
        return (MediaMetadata::default(), Vec::new());
    };
    let mut merged = keeper.record.metadata.clone();
    let mut merges = Vec::new();

    // Keywords: case-insensitive union, first spelling wins.
    let mut seen: Vec<String> = Vec::new();
    let mut keywords: Vec<String> = Vec::new();
    let mut keyword_sources: Vec<FileId> = Vec::new();
    for candidate in ranked {
        for keyword in &candidate.record.metadata.keywords {
            let folded = keyword.trim().to_lowercase();
            if folded.is_empty() || seen.contains(&folded) {
                continue;
            }
            seen.push(folded);
            keywords.push(keyword.trim().to_string());
            if candidate.record.id != keeper.record.id
                && !keyword_sources.contains(&candidate.record.id)
            {
                keyword_sources.push(candidate.record.id);
            }
        }
    }
    keywords.sort_by_key(|k| k.to_lowercase());
    if !keyword_sources.is_empty() {
        merges.push(FieldMerge {
            field: MetadataField::Keywords,
            sources: keyword_sources,
            value: keywords.join(", "),
        });
    }
    merged.keywords = keywords;

    if let Some(earliest) = ranked
        .iter()
        .filter_map(|c| c.record.metadata.capture_date.map(|d| (d, c.record.id)))
        .min()
    {
        if merged.capture_date != Some(earliest.0) {
            merged.capture_date = Some(earliest.0);
            merges.push(FieldMerge {
                field: MetadataField::CaptureDate,
                sources: vec![earliest.1],
                value: DateTime::<Utc>::from_timestamp(earliest.0, 0)
                    .map(|d| d.to_rfc3339())
                    .unwrap_or_else(|| earliest.0.to_string()),
            });
        }
    }

    let mut best_gps: Option<(&KeeperCandidate, u8)> = None;
    for candidate in ranked {
        if let Some(gps) = &candidate.record.metadata.gps {
            if best_gps.map_or(true, |(_, score)| gps.completeness() > score) {
                best_gps = Some((candidate, gps.completeness()));
            }
        }
    }
    if let Some((source, _)) = best_gps {
        if source.record.id != keeper.record.id {
            merged.gps = source.record.metadata.gps;
            if let Some(gps) = merged.gps {
                merges.push(FieldMerge {
                    field: MetadataField::Gps,
                    sources: vec![source.record.id],
                    value: format!("{:.6}, {:.6}", gps.latitude, gps.longitude),
                });
            }
        }
    }

    if merged.camera_make.is_none() && merged.camera_model.is_none() {
        if let Some(source) = ranked.iter().find(|c| {
            c.record.metadata.camera_make.is_some() || c.record.metadata.camera_model.is_some()
        }) {
            merged.camera_make = source.record.metadata.camera_make.clone();
            merged.camera_model = source.record.metadata.camera_model.clone();
            merges.push(FieldMerge {
                field: MetadataField::Camera,
                sources: vec![source.record.id],
                value: [merged.camera_make.as_deref(), merged.camera_model.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" "),
            });
        }
    }

    if merged.technical.is_none() {
        if let Some(source) = ranked.iter().find(|c| c.record.metadata.technical.is_some()) {
            merged.technical = source.record.metadata.technical.clone();
            merges.push(FieldMerge {
                field: MetadataField::Technical,
                sources: vec![source.record.id],
                value: "technical metadata".to_string(),
            });
        }
    }

    (merged, merges)
}

/// Builds merge plans from the catalog. Read-only.
///
/// Member locations come from a [`FileLocator`]; by default the catalog
/// itself resolves them.
pub struct MergePlanner<'a> {
    db: &'a Database,
    locator: &'a dyn FileLocator,
}

impl<'a> MergePlanner<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db, locator: db }
    }

    pub fn with_locator(db: &'a Database, locator: &'a dyn FileLocator) -> Self {
        Self { db, locator }
    }

    pub fn plan(
        &self,
        group_id: GroupId,
        keeper_override: Option<FileId>,
    ) -> Result<MergePlan, Error> {
        let group = self
            .db
            .get_group(group_id)?
            .ok_or(PlanningError::GroupNotFound(group_id))?;
        if group.status != GroupStatus::Open {
            return Err(PlanningError::GroupClosed(group_id).into());
        }

        let members = self.db.get_group_members(group_id)?;
        if let Some(file_id) = keeper_override {
            if !members.iter().any(|(record, _)| record.id == file_id) {
                return Err(PlanningError::KeeperNotInGroup { group_id, file_id }.into());
            }
        }
        if !members.is_empty() && members.iter().all(|(_, removed)| *removed) {
            return Err(PlanningError::AllMembersRemoved(group_id).into());
        }

        let mut ranked = Vec::new();
        for (mut record, removed) in members {
            if removed {
                continue;
            }
            let on_disk = match self.locator.resolve(record.id)? {
                Some(path) if path.is_file() => {
                    record.path = path;
                    true
                }
                _ => {
                    debug!(
                        group_id,
                        "Member {} cannot be found (last seen at {})",
                        record.id,
                        record.path.display()
                    );
                    false
                }
            };
            let signature = self.db.get_signature(record.id)?;
            ranked.push((KeeperCandidate { record, signature }, on_disk));
        }

        ranked.sort_by(|a, b| keeper_order(&a.0, &b.0));
        let keeper_index = match keeper_override {
            Some(file_id) => ranked.iter().position(|(c, _)| c.record.id == file_id),
            None => (!ranked.is_empty()).then_some(0),
        };
        if let Some(index) = keeper_index {
            let (keeper, on_disk) = ranked.remove(index);
            if !on_disk {
                return Err(PlanningError::KeeperMissing {
                    file_id: keeper.record.id,
                }
                .into());
            }
            ranked.insert(0, (keeper, true));
        }

        let candidates: Vec<KeeperCandidate> = ranked
            .into_iter()
            .filter(|(_, on_disk)| *on_disk)
            .map(|(candidate, _)| candidate)
            .collect();
        if candidates.len() < 2 {
            return Err(PlanningError::TooFewMembers {
                group_id,
                members: candidates.len(),
            }
            .into());
        }

        let (merged_metadata, field_merges) = merge_metadata(&candidates);
        let mut planned = candidates
            .iter()
            .map(|c| observe(&c.record))
            .collect::<Result<Vec<_>, Error>>()?;
        let keeper = planned.remove(0);

        info!(
            group_id,
            "Planned merge: keep {} ({}), remove {} files",
            keeper.file_id,
            keeper.path.display(),
            planned.len()
        );
        Ok(MergePlan {
            group_id,
            keeper,
            removals: planned,
            keeper_metadata: candidates[0].record.metadata.clone(),
            merged_metadata,
            field_merges,
            created_at: Utc::now(),
        })
    }
}

fn observe(record: &FileRecord) -> Result<PlannedFile, Error> {
    let metadata = fs::metadata(&record.path)?;
    let modified_at = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(PlannedFile {
        file_id: record.id,
        path: record.path.clone(),
        size: metadata.len(),
        modified_at,
        digest: fsops::file_digest(&record.path)?,
    })
}
