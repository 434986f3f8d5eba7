use super::score::{MatchClass, PairOutcome, PairwiseScore, Penalty, SimilarityScorer};
use super::Diagnostic;
use crate::model::{FileId, GroupId, GroupStatus};
use crate::signature::SignatureSnapshot;
use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Disjoint-set forest over file ids, with path compression and union by rank.
#[derive(Debug, Default)]
pub struct UnionFind {
    parent: AHashMap<FileId, FileId>,
    rank: AHashMap<FileId, u8>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&mut self, x: FileId) -> FileId {
        let mut root = x;
        while let Some(&parent) = self.parent.get(&root) {
            if parent == root {
                break;
            }
            root = parent;
        }
        if !self.parent.contains_key(&x) {
            self.parent.insert(x, x);
            return x;
        }

        let mut node = x;
        while node != root {
            let next = self.parent[&node];
            self.parent.insert(node, root);
            node = next;
        }
        root
    }

    /// Returns false when both were already in the same set.
    pub fn union(&mut self, a: FileId, b: FileId) -> bool {
        let (root_a, root_b) = (self.find(a), self.find(b));
        if root_a == root_b {
            return false;
        }
        let rank_a = self.rank.get(&root_a).copied().unwrap_or(0);
        let rank_b = self.rank.get(&root_b).copied().unwrap_or(0);
        match rank_a.cmp(&rank_b) {
            Ordering::Less => {
                self.parent.insert(root_a, root_b);
            }
            Ordering::Greater => {
                self.parent.insert(root_b, root_a);
            }
            Ordering::Equal => {
                self.parent.insert(root_b, root_a);
                self.rank.insert(root_a, rank_a + 1);
            }
        }
        true
    }

    /// All sets with more than one element, members ascending, sets ordered by
    /// their smallest member.
    pub fn sets(&mut self) -> Vec<Vec<FileId>> {
        let mut ids: Vec<FileId> = self.parent.keys().copied().collect();
        ids.sort_unstable();

        let mut by_root: AHashMap<FileId, Vec<FileId>> = AHashMap::new();
        for id in ids {
            let root = self.find(id);
            by_root.entry(root).or_default().push(id);
        }

        let mut sets: Vec<Vec<FileId>> = by_root
            .into_values()
            .filter(|members| members.len() > 1)
            .collect();
        sets.sort_by_key(|members| members[0]);
        sets
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    /// Every edge is a checksum match.
    Exact,
    Duplicate,
    /// At least one edge needs review.
    Similar,
}

impl GroupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKind::Exact => "exact",
            GroupKind::Duplicate => "duplicate",
            GroupKind::Similar => "similar",
        }
    }
}

impl std::str::FromStr for GroupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(GroupKind::Exact),
            "duplicate" => Ok(GroupKind::Duplicate),
            "similar" => Ok(GroupKind::Similar),
            other => Err(format!("unknown group kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub file_id: FileId,
    /// Confidence of the strongest edge touching this member.
    pub confidence: f64,
    pub distance: Option<u32>,
    pub penalties: Vec<Penalty>,
    /// Other end of that edge.
    pub peer: Option<FileId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: GroupId,
    /// Ascending file id.
    pub members: Vec<GroupMember>,
    pub edges: Vec<PairwiseScore>,
    /// Weakest edge confidence.
    pub confidence: f64,
    pub kind: GroupKind,
    pub rationale: String,
    pub status: GroupStatus,
    /// Some indirectly linked members compare below the divergence floor.
    pub needs_manual_split: bool,
    pub divergent_pairs: Vec<(FileId, FileId, f64)>,
}

impl DuplicateGroup {
    pub fn file_ids(&self) -> Vec<FileId> {
        self.members.iter().map(|m| m.file_id).collect()
    }

    pub fn contains(&self, file_id: FileId) -> bool {
        self.members.iter().any(|m| m.file_id == file_id)
    }
}

/// Forms groups as connected components of accepted edges.
pub struct GroupBuilder<'s, 'c> {
    scorer: &'s SimilarityScorer<'c>,
    snapshot: &'s SignatureSnapshot,
}

impl<'s, 'c> GroupBuilder<'s, 'c> {
    pub fn new(scorer: &'s SimilarityScorer<'c>, snapshot: &'s SignatureSnapshot) -> Self {
        Self { scorer, snapshot }
    }

    /// Builds groups in ascending order of smallest member, calling
    /// `on_group` as each one is finalised. Edge order does not matter.
    pub fn build(
        &self,
        mut edges: Vec<PairwiseScore>,
        mut on_group: impl FnMut(&DuplicateGroup),
    ) -> (Vec<DuplicateGroup>, Vec<Diagnostic>) {
        edges.retain(|edge| edge.is_accepted());
        edges.sort_by(|a, b| {
            a.pair()
                .cmp(&b.pair())
                .then_with(|| b.exact.cmp(&a.exact))
                .then_with(|| b.confidence.total_cmp(&a.confidence))
        });
        edges.dedup_by_key(|edge| edge.pair());

        let mut union_find = UnionFind::new();
        for edge in &edges {
            union_find.union(edge.file_a, edge.file_b);
        }

        let mut edges_by_root: AHashMap<FileId, Vec<PairwiseScore>> = AHashMap::new();
        for edge in edges {
            let root = union_find.find(edge.file_a);
            edges_by_root.entry(root).or_default().push(edge);
        }

        let mut groups = Vec::new();
        let mut diagnostics = Vec::new();
        for (ordinal, members) in union_find.sets().into_iter().enumerate() {
            let root = union_find.find(members[0]);
            let group_edges = edges_by_root.remove(&root).unwrap_or_default();
            let group = self.finalise(ordinal as GroupId + 1, members, group_edges, &mut diagnostics);
            on_group(&group);
            groups.push(group);
        }

        debug!(
            "Grouping produced {} groups ({} flagged for manual split)",
            groups.len(),
            groups.iter().filter(|g| g.needs_manual_split).count()
        );
        (groups, diagnostics)
    }

    fn finalise(
        &self,
        id: GroupId,
        file_ids: Vec<FileId>,
        edges: Vec<PairwiseScore>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> DuplicateGroup {
        let confidence = edges
            .iter()
            .map(|e| e.confidence)
            .fold(1.0_f64, f64::min);

        let kind = if edges.iter().all(|e| e.exact) {
            GroupKind::Exact
        } else if edges.iter().all(|e| e.class == MatchClass::Duplicate) {
            GroupKind::Duplicate
        } else {
            GroupKind::Similar
        };

        let members: Vec<GroupMember> = file_ids
            .iter()
            .map(|&file_id| {
                let best = edges
                    .iter()
                    .filter(|e| e.file_a == file_id || e.file_b == file_id)
                    .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
                GroupMember {
                    file_id,
                    confidence: best.map(|e| e.confidence).unwrap_or(confidence),
                    distance: best.and_then(|e| e.distances.hamming),
                    penalties: best.map(|e| e.penalties.clone()).unwrap_or_default(),
                    peer: best.map(|e| e.other(file_id)),
                }
            })
            .collect();

        let divergent_pairs = self.divergent_pairs(&file_ids, &edges, diagnostics);
        let needs_manual_split = !divergent_pairs.is_empty();
        if needs_manual_split {
            warn!(
                "Group {} links {} pairs below the divergence floor; flagged for manual split",
                id,
                divergent_pairs.len()
            );
        }

        let exact_edges = edges.iter().filter(|e| e.exact).count();
        let rationale = format!(
            "{} files linked by {} checksum and {} perceptual matches, weakest link {:.2}",
            file_ids.len(),
            exact_edges,
            edges.len() - exact_edges,
            confidence
        );

        DuplicateGroup {
            id,
            members,
            edges,
            confidence,
            kind,
            rationale,
            status: GroupStatus::Open,
            needs_manual_split,
            divergent_pairs,
        }
    }

    /// Scores every member pair that is not joined by a direct edge.
    fn divergent_pairs(
        &self,
        file_ids: &[FileId],
        edges: &[PairwiseScore],
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Vec<(FileId, FileId, f64)> {
        let direct: AHashSet<(FileId, FileId)> = edges.iter().map(|e| e.pair()).collect();
        let floor = self.scorer.config().divergence_floor;
        let mut divergent = Vec::new();

        for (i, &a) in file_ids.iter().enumerate() {
            for &b in &file_ids[i + 1..] {
                if direct.contains(&(a, b)) {
                    continue;
                }
                let (Some(entry_a), Some(entry_b)) = (self.snapshot.get(a), self.snapshot.get(b))
                else {
                    divergent.push((a, b, 0.0));
                    continue;
                };
                let outcome = self.scorer.score(entry_a, entry_b);
                if let PairOutcome::Ambiguous(reason) = &outcome {
                    diagnostics.push(Diagnostic::ambiguous(a, b, reason.clone()));
                }
                let confidence = outcome.confidence();
                if confidence < floor {
                    divergent.push((a, b, confidence));
                }
            }
        }
        divergent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionConfig;
    use crate::detection::score::{RawDistances, Signal, SignalContribution};
    use crate::model::{
        Dimensions, FileRecord, HashAlgorithm, HashFamily, MediaMetadata, MediaType,
        PerceptualHash, Signature,
    };
    use crate::signature::SnapshotEntry;
    use std::path::PathBuf;

    const DHASH: HashAlgorithm = HashAlgorithm::new(HashFamily::DHash, 1);

    fn entry(id: FileId, hash: u64) -> SnapshotEntry {
        SnapshotEntry {
            record: FileRecord {
                id,
                path: PathBuf::from(format!("/m/{}.jpg", id)),
                size: 100 + id as u64,
                created_at: None,
                modified_at: 0,
                media_type: MediaType::Image,
                metadata: MediaMetadata::default(),
            },
            signature: Some(Signature {
                checksum: Some(format!("sum{}", id)),
                perceptual_hashes: vec![PerceptualHash::from_u64(DHASH, hash)],
                dimensions: Some(Dimensions {
                    width: 64,
                    height: 64,
                }),
                duration_ms: None,
                computed_at: 0,
            }),
        }
    }

    fn edge(a: FileId, b: FileId, confidence: f64, class: MatchClass) -> PairwiseScore {
        PairwiseScore {
            file_a: a,
            file_b: b,
            confidence,
            class,
            exact: false,
            contributions: vec![SignalContribution {
                signal: Signal::Visual,
                sub_score: confidence,
                weight: 1.0,
                contribution: confidence,
            }],
            penalties: Vec::new(),
            distances: RawDistances::default(),
            duration_mismatch: false,
        }
    }

    #[test]
    fn test_union_find_merges_transitively() {
        let mut uf = UnionFind::new();
        assert!(uf.union(5, 3));
        assert!(uf.union(3, 9));
        assert!(!uf.union(9, 5));
        uf.union(20, 21);
        assert_eq!(uf.sets(), vec![vec![3, 5, 9], vec![20, 21]]);
    }

    #[test]
    fn test_transitive_edges_form_one_group_with_min_confidence() {
        let config = DetectionConfig::default();
        let scorer = SimilarityScorer::new(&config);
        // 1~2 and 2~3 are close; 1 and 3 differ by 6 bits, still above the floor
        let snapshot = SignatureSnapshot::from_entries(vec![
            entry(1, 0),
            entry(2, 0b111),
            entry(3, 0b111_111),
        ]);
        let builder = GroupBuilder::new(&scorer, &snapshot);
        let edges = vec![
            edge(2, 3, 0.90, MatchClass::Duplicate),
            edge(1, 2, 0.95, MatchClass::Duplicate),
        ];

        let mut seen = Vec::new();
        let (groups, _) = builder.build(edges, |g| seen.push(g.id));
        assert_eq!(groups.len(), 1);
        assert_eq!(seen, vec![1]);
        assert_eq!(groups[0].file_ids(), vec![1, 2, 3]);
        assert_eq!(groups[0].confidence, 0.90);
        assert_eq!(groups[0].kind, GroupKind::Duplicate);
        assert!(!groups[0].needs_manual_split);
        assert_eq!(groups[0].members[1].confidence, 0.95);
    }

    #[test]
    fn test_chained_group_with_divergent_ends_is_flagged() {
        let config = DetectionConfig::default();
        let scorer = SimilarityScorer::new(&config);
        let snapshot =
            SignatureSnapshot::from_entries(vec![entry(1, 0), entry(2, 0xFFFF), entry(3, u64::MAX)]);
        let builder = GroupBuilder::new(&scorer, &snapshot);
        let edges = vec![
            edge(1, 2, 0.70, MatchClass::Similar),
            edge(2, 3, 0.70, MatchClass::Similar),
        ];

        let (groups, _) = builder.build(edges, |_| {});
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].kind, GroupKind::Similar);
        assert!(groups[0].needs_manual_split);
        assert_eq!(groups[0].divergent_pairs, vec![(1, 3, 0.0)]);
    }

    #[test]
    fn test_discarded_edges_do_not_link() {
        let config = DetectionConfig::default();
        let scorer = SimilarityScorer::new(&config);
        let snapshot = SignatureSnapshot::from_entries(vec![entry(1, 0), entry(2, 0)]);
        let builder = GroupBuilder::new(&scorer, &snapshot);
        let (groups, _) = builder.build(vec![edge(1, 2, 0.5, MatchClass::Discarded)], |_| {});
        assert!(groups.is_empty());
    }

    #[test]
    fn test_edge_order_does_not_change_groups() {
        let config = DetectionConfig::default();
        let scorer = SimilarityScorer::new(&config);
        let snapshot = SignatureSnapshot::from_entries((1..=6).map(|id| entry(id, 0)));
        let builder = GroupBuilder::new(&scorer, &snapshot);
        let edges = vec![
            edge(1, 2, 0.9, MatchClass::Duplicate),
            edge(4, 5, 0.88, MatchClass::Duplicate),
            edge(2, 3, 0.91, MatchClass::Duplicate),
            edge(5, 6, 0.7, MatchClass::Similar),
            edge(1, 2, 0.9, MatchClass::Duplicate),
        ];
        let mut reversed = edges.clone();
        reversed.reverse();

        let (forward, _) = builder.build(edges, |_| {});
        let (backward, _) = builder.build(reversed, |_| {});
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 2);
        assert_eq!(forward[0].edges.len(), 2);
    }
}
