use super::models::*;
use super::sqlite::Database;
use crate::detection::{DuplicateGroup, GroupMember};
use crate::engine::DetectionReport;
use crate::error::Error;
use crate::model::{
    Dimensions, FileId, FileRecord, GroupId, GroupStatus, MediaMetadata, PerceptualHash, Signature,
};
use crate::signature::{FileCatalog, FileLocator, SignatureProvider};
use rusqlite::{params, OptionalExtension, Result, Row};
use std::path::PathBuf;
use tracing::{debug, warn};

const FILE_COLUMNS: &str =
    "id, path, file_size, created_at, modified_at, media_type, metadata_json, removed";

fn file_record_from_row(row: &Row<'_>) -> Result<(FileRecord, bool)> {
    let path: String = row.get(1)?;
    let media_type: String = row.get(5)?;
    let metadata: String = row.get(6)?;
    Ok((
        FileRecord {
            id: row.get(0)?,
            path: PathBuf::from(path),
            size: row.get::<_, i64>(2)? as u64,
            created_at: row.get(3)?,
            modified_at: row.get(4)?,
            media_type: parse_column(5, &media_type)?,
            metadata: from_json(6, &metadata)?,
        },
        row.get(7)?,
    ))
}

impl Database {
    // ── File Records ─────────────────────────────────────────────

    pub fn upsert_file_records(&self, records: &[FileRecord]) -> Result<usize> {
        let tx = self.connection().unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO file_record \
                 (id, path, file_size, created_at, modified_at, media_type, metadata_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(id) DO UPDATE SET \
                     path = excluded.path, \
                     file_size = excluded.file_size, \
                     created_at = excluded.created_at, \
                     modified_at = excluded.modified_at, \
                     media_type = excluded.media_type, \
                     metadata_json = excluded.metadata_json",
            )?;
            for record in records {
                count += stmt.execute(params![
                    record.id,
                    record.path.to_string_lossy(),
                    record.size as i64,
                    record.created_at,
                    record.modified_at,
                    record.media_type.as_str(),
                    to_json(&record.metadata)?,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Upserted {} file records", count);
        Ok(count)
    }

    pub fn get_file_record(&self, file_id: FileId) -> Result<Option<FileRecord>> {
        self.connection()
            .query_row(
                &format!("SELECT {} FROM file_record WHERE id = ?1", FILE_COLUMNS),
                params![file_id],
                file_record_from_row,
            )
            .optional()
            .map(|found| found.map(|(record, _)| record))
    }

    /// Ids of every file not removed by a merge, ascending.
    pub fn present_file_ids(&self) -> Result<Vec<FileId>> {
        let mut stmt = self
            .connection()
            .prepare("SELECT id FROM file_record WHERE removed = 0 ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn is_file_removed(&self, file_id: FileId) -> Result<bool> {
        self.connection().query_row(
            "SELECT removed FROM file_record WHERE id = ?1",
            params![file_id],
            |row| row.get(0),
        )
    }

    pub fn update_file_metadata(&self, file_id: FileId, metadata: &MediaMetadata) -> Result<()> {
        self.connection().execute(
            "UPDATE file_record SET metadata_json = ?1 WHERE id = ?2",
            params![to_json(metadata)?, file_id],
        )?;
        Ok(())
    }

    pub fn mark_files_removed(&self, file_ids: &[FileId]) -> Result<usize> {
        self.set_removed(file_ids, true)
    }

    pub fn restore_files(&self, file_ids: &[FileId]) -> Result<usize> {
        self.set_removed(file_ids, false)
    }

    fn set_removed(&self, file_ids: &[FileId], removed: bool) -> Result<usize> {
        let tx = self.connection().unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare_cached("UPDATE file_record SET removed = ?1 WHERE id = ?2")?;
            for file_id in file_ids {
                count += stmt.execute(params![removed, file_id])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    // ── Signatures ───────────────────────────────────────────────

    pub fn upsert_signature(&self, file_id: FileId, signature: &Signature) -> Result<()> {
        let tx = self.connection().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO signature (file_id, checksum, width, height, duration_ms, computed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(file_id) DO UPDATE SET \
                 checksum = excluded.checksum, \
                 width = excluded.width, \
                 height = excluded.height, \
                 duration_ms = excluded.duration_ms, \
                 computed_at = excluded.computed_at",
            params![
                file_id,
                signature.checksum,
                signature.dimensions.map(|d| d.width),
                signature.dimensions.map(|d| d.height),
                signature.duration_ms.map(|ms| ms as i64),
                signature.computed_at,
            ],
        )?;
        tx.execute(
            "DELETE FROM perceptual_hash WHERE file_id = ?1",
            params![file_id],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO perceptual_hash (file_id, frame_index, algorithm, bit_length, bits) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (index, hash) in signature.perceptual_hashes.iter().enumerate() {
                stmt.execute(params![
                    file_id,
                    index as i64,
                    hash.algorithm.to_string(),
                    hash.bit_length,
                    hash.bits,
                ])?;
            }
        }
        tx.commit()
    }

    pub fn get_signature(&self, file_id: FileId) -> Result<Option<Signature>> {
        let row = self
            .connection()
            .query_row(
                "SELECT checksum, width, height, duration_ms, computed_at \
                 FROM signature WHERE file_id = ?1",
                params![file_id],
                |row| {
                    let width: Option<u32> = row.get(1)?;
                    let height: Option<u32> = row.get(2)?;
                    Ok(Signature {
                        checksum: row.get(0)?,
                        perceptual_hashes: Vec::new(),
                        dimensions: width
                            .zip(height)
                            .map(|(width, height)| Dimensions { width, height }),
                        duration_ms: row.get::<_, Option<i64>>(3)?.map(|ms| ms.max(0) as u64),
                        computed_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        let Some(mut signature) = row else {
            return Ok(None);
        };

        let mut stmt = self.connection().prepare_cached(
            "SELECT algorithm, bit_length, bits FROM perceptual_hash \
             WHERE file_id = ?1 ORDER BY frame_index",
        )?;
        signature.perceptual_hashes = stmt
            .query_map(params![file_id], |row| {
                let algorithm: String = row.get(0)?;
                Ok(PerceptualHash {
                    algorithm: parse_column(0, &algorithm)?,
                    bit_length: row.get(1)?,
                    bits: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(signature))
    }

    // ── Detection Runs ───────────────────────────────────────────

    /// Persists a detection report. Open groups from earlier runs are
    /// dismissed first, and a group is skipped if any member already belongs
    /// to an open group, so a file is never in two open groups.
    pub fn save_detection_run(&self, report: &DetectionReport) -> Result<PersistSummary> {
        let now = chrono::Utc::now();
        let elapsed = chrono::Duration::from_std(report.stats.duration)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let started_at = (now - elapsed).to_rfc3339();
        let created_at = now.to_rfc3339();

        let tx = self.connection().unchecked_transaction()?;
        let dismissed = tx.execute(
            "UPDATE duplicate_group SET status = 'dismissed' WHERE status = 'open'",
            [],
        )?;
        tx.execute(
            "INSERT INTO detection_run (started_at, files, hash_comparisons, diagnostics) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                started_at,
                report.stats.files as i64,
                report.stats.hash_comparisons as i64,
                report.diagnostics.len() as i64,
            ],
        )?;
        let run_id = tx.last_insert_rowid();

        let mut summary = PersistSummary {
            run_id,
            dismissed,
            ..PersistSummary::default()
        };
        {
            let mut open_stmt = tx.prepare_cached(
                "SELECT COUNT(*) FROM group_member gm \
                 JOIN duplicate_group dg ON dg.id = gm.group_id \
                 WHERE dg.status = 'open' AND gm.file_id = ?1",
            )?;
            let mut group_stmt = tx.prepare_cached(
                "INSERT INTO duplicate_group \
                 (run_id, kind, confidence, rationale, status, needs_manual_split, \
                  divergent_json, edges_json, created_at) \
                 VALUES (?1, ?2, ?3, ?4, 'open', ?5, ?6, ?7, ?8)",
            )?;
            let mut member_stmt = tx.prepare_cached(
                "INSERT INTO group_member \
                 (group_id, file_id, confidence, distance, penalties_json, peer_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;

            for group in &report.groups {
                let mut conflict = None;
                for member in &group.members {
                    let open: i64 = open_stmt.query_row(params![member.file_id], |row| row.get(0))?;
                    if open > 0 {
                        conflict = Some(member.file_id);
                        break;
                    }
                }
                if let Some(file_id) = conflict {
                    warn!(
                        "Skipping group {}: file {} is already in an open group",
                        group.id, file_id
                    );
                    summary.skipped.push(group.id);
                    continue;
                }

                group_stmt.execute(params![
                    run_id,
                    group.kind.as_str(),
                    group.confidence,
                    group.rationale,
                    group.needs_manual_split,
                    to_json(&group.divergent_pairs)?,
                    to_json(&group.edges)?,
                    created_at,
                ])?;
                let group_id = tx.last_insert_rowid();
                for member in &group.members {
                    member_stmt.execute(params![
                        group_id,
                        member.file_id,
                        member.confidence,
                        member.distance,
                        to_json(&member.penalties)?,
                        member.peer,
                    ])?;
                }
                summary.group_ids.push(group_id);
            }
        }

        tx.execute(
            "UPDATE detection_run SET completed_at = ?1, groups_found = ?2, groups_skipped = ?3 \
             WHERE id = ?4",
            params![
                chrono::Utc::now().to_rfc3339(),
                summary.group_ids.len() as i64,
                summary.skipped.len() as i64,
                run_id
            ],
        )?;
        tx.commit()?;
        debug!(
            "Persisted detection run {}: {} groups, {} skipped, {} dismissed",
            run_id,
            summary.group_ids.len(),
            summary.skipped.len(),
            dismissed
        );
        Ok(summary)
    }

    pub fn latest_detection_run(&self) -> Result<Option<DetectionRun>> {
        self.connection()
            .query_row(
                "SELECT id, started_at, completed_at, files, groups_found, groups_skipped, \
                        hash_comparisons, diagnostics \
                 FROM detection_run ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(DetectionRun {
                        id: row.get(0)?,
                        started_at: row.get(1)?,
                        completed_at: row.get(2)?,
                        files: row.get(3)?,
                        groups_found: row.get(4)?,
                        groups_skipped: row.get(5)?,
                        hash_comparisons: row.get(6)?,
                        diagnostics: row.get(7)?,
                    })
                },
            )
            .optional()
    }

    // ── Duplicate Groups ─────────────────────────────────────────

    /// Groups in id order, optionally filtered by status.
    pub fn get_duplicate_groups(&self, status: Option<GroupStatus>) -> Result<Vec<DuplicateGroup>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, kind, confidence, rationale, status, needs_manual_split, \
                    divergent_json, edges_json \
             FROM duplicate_group WHERE (?1 IS NULL OR status = ?1) ORDER BY id",
        )?;
        let mut groups = stmt
            .query_map(params![status.map(|s| s.as_str())], group_from_row)?
            .collect::<Result<Vec<_>>>()?;
        for group in &mut groups {
            group.members = self.load_members(group.id)?;
        }
        Ok(groups)
    }

    pub fn get_group(&self, group_id: GroupId) -> Result<Option<DuplicateGroup>> {
        let group = self
            .connection()
            .query_row(
                "SELECT id, kind, confidence, rationale, status, needs_manual_split, \
                        divergent_json, edges_json \
                 FROM duplicate_group WHERE id = ?1",
                params![group_id],
                group_from_row,
            )
            .optional()?;
        match group {
            Some(mut group) => {
                group.members = self.load_members(group_id)?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    /// Catalog records of a group's members, ascending id, with their removed flag.
    pub fn get_group_members(&self, group_id: GroupId) -> Result<Vec<(FileRecord, bool)>> {
        let mut stmt = self.connection().prepare(
            "SELECT f.id, f.path, f.file_size, f.created_at, f.modified_at, f.media_type, \
                    f.metadata_json, f.removed \
             FROM file_record f \
             JOIN group_member gm ON gm.file_id = f.id \
             WHERE gm.group_id = ?1 ORDER BY f.id",
        )?;
        let members = stmt
            .query_map(params![group_id], file_record_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(members)
    }

    pub fn set_group_status(&self, group_id: GroupId, status: GroupStatus) -> Result<usize> {
        let updated = self.connection().execute(
            "UPDATE duplicate_group SET status = ?1 WHERE id = ?2",
            params![status.as_str(), group_id],
        )?;
        debug!("Group {} set to {}", group_id, status.as_str());
        Ok(updated)
    }

    fn load_members(&self, group_id: GroupId) -> Result<Vec<GroupMember>> {
        let mut stmt = self.connection().prepare_cached(
            "SELECT file_id, confidence, distance, penalties_json, peer_id \
             FROM group_member WHERE group_id = ?1 ORDER BY file_id",
        )?;
        let members = stmt
            .query_map(params![group_id], |row| {
                let penalties: String = row.get(3)?;
                Ok(GroupMember {
                    file_id: row.get(0)?,
                    confidence: row.get(1)?,
                    distance: row.get(2)?,
                    penalties: from_json(3, &penalties)?,
                    peer: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(members)
    }
}

fn group_from_row(row: &Row<'_>) -> Result<DuplicateGroup> {
    let kind: String = row.get(1)?;
    let status: String = row.get(4)?;
    let divergent: String = row.get(6)?;
    let edges: String = row.get(7)?;
    Ok(DuplicateGroup {
        id: row.get(0)?,
        members: Vec::new(),
        edges: from_json(7, &edges)?,
        confidence: row.get(2)?,
        kind: parse_column(1, &kind)?,
        rationale: row.get(3)?,
        status: parse_column(4, &status)?,
        needs_manual_split: row.get(5)?,
        divergent_pairs: from_json(6, &divergent)?,
    })
}

impl FileCatalog for Database {
    fn file_record(&self, file_id: FileId) -> std::result::Result<Option<FileRecord>, Error> {
        Ok(self.get_file_record(file_id)?)
    }
}

impl SignatureProvider for Database {
    fn read_signature(&self, file_id: FileId) -> std::result::Result<Option<Signature>, Error> {
        Ok(self.get_signature(file_id)?)
    }
}

impl FileLocator for Database {
    /// Current path of a file that has not been merged away.
    fn resolve(&self, file_id: FileId) -> std::result::Result<Option<PathBuf>, Error> {
        let found = self
            .connection()
            .query_row(
                "SELECT path, removed FROM file_record WHERE id = ?1",
                params![file_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
            )
            .optional()?;
        Ok(found.and_then(|(path, removed)| (!removed).then(|| PathBuf::from(path))))
    }
}
