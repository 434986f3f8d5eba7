use crate::error::Error;
use crate::model::{FileId, GroupId, MediaMetadata};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovedFile {
    pub file_id: FileId,
    pub original_path: PathBuf,
    pub staged_path: PathBuf,
    pub size: u64,
    pub digest: String,
}

/// A committed merge, with everything needed to reverse it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    pub transaction_id: String,
    pub group_id: GroupId,
    pub keeper_id: FileId,
    pub keeper_path: PathBuf,
    pub removed: Vec<RemovedFile>,
    /// Keeper sidecar content before the merge.
    pub metadata_before: Option<String>,
    /// Keeper catalog metadata before the merge.
    pub catalog_metadata_before: MediaMetadata,
    pub metadata_after: MediaMetadata,
    pub committed_at: DateTime<Utc>,
    pub status: TransactionStatus,
    #[serde(default)]
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl TransactionLogEntry {
    pub fn removed_ids(&self) -> Vec<FileId> {
        self.removed.iter().map(|r| r.file_id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogRecord {
    Commit(TransactionLogEntry),
    RollBack {
        transaction_id: String,
        timestamp: DateTime<Utc>,
    },
}

/// Append-only JSON-lines log of merge transactions.
///
/// A merge is committed exactly when its `commit` record has been written and
/// fsynced. The file is held under an exclusive advisory lock for the lifetime
/// of the log, so only one process appends at a time.
pub struct TransactionLog {
    path: PathBuf,
    file: Mutex<File>,
    entries: Mutex<Vec<TransactionLogEntry>>,
}

impl TransactionLog {
    /// Opens or creates the log and replays it. A torn final line, left by a
    /// crash before fsync, is truncated; corruption anywhere else is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                format!(
                    "transaction log {} is locked by another process: {}",
                    path.display(),
                    e
                ),
            )
        })?;

        let mut entries: Vec<TransactionLogEntry> = Vec::new();
        let mut truncate_to: Option<u64> = None;
        {
            file.seek(SeekFrom::Start(0))?;
            let lines: Vec<String> = BufReader::new(&file)
                .lines()
                .collect::<Result<Vec<_>, _>>()?;
            let count = lines.len();
            let mut offset: u64 = 0;

            for (index, line) in lines.iter().enumerate() {
                let line_len = (line.len() + 1) as u64;
                if line.trim().is_empty() {
                    offset += line_len;
                    continue;
                }
                match serde_json::from_str::<LogRecord>(line) {
                    Ok(record) => apply(&mut entries, record).map_err(|reason| {
                        Error::CorruptLog {
                            line: index + 1,
                            reason,
                        }
                    })?,
                    Err(e) if index == count - 1 => {
                        warn!(
                            line = index + 1,
                            "Truncating torn tail record from {}: {}",
                            path.display(),
                            e
                        );
                        truncate_to = Some(offset);
                    }
                    Err(e) => {
                        return Err(Error::CorruptLog {
                            line: index + 1,
                            reason: e.to_string(),
                        });
                    }
                }
                offset += line_len;
            }
        }

        if let Some(len) = truncate_to {
            file.set_len(len)?;
            file.sync_all()?;
        }

        debug!(
            "Transaction log {} replayed: {} transactions",
            path.display(),
            entries.len()
        );
        Ok(Self {
            path,
            file: Mutex::new(file),
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably records a commit. Returns only after fsync.
    pub fn append_commit(&self, entry: &TransactionLogEntry) -> Result<(), Error> {
        let mut entries = self.lock_entries()?;
        if entries
            .iter()
            .any(|e| e.transaction_id == entry.transaction_id)
        {
            return Err(Error::Other(format!(
                "transaction {} is already in the log",
                entry.transaction_id
            )));
        }
        let mut committed = entry.clone();
        committed.status = TransactionStatus::Committed;
        committed.rolled_back_at = None;
        self.write_record(&LogRecord::Commit(committed.clone()))?;
        entries.push(committed);
        Ok(())
    }

    /// Durably marks a committed transaction as rolled back.
    pub fn append_rollback(&self, transaction_id: &str) -> Result<DateTime<Utc>, Error> {
        let mut entries = self.lock_entries()?;
        let timestamp = Utc::now();
        let record = LogRecord::RollBack {
            transaction_id: transaction_id.to_string(),
            timestamp,
        };
        let mut scratch = entries.clone();
        apply(&mut scratch, record.clone()).map_err(Error::Other)?;
        self.write_record(&record)?;
        *entries = scratch;
        Ok(timestamp)
    }

    pub fn get(&self, transaction_id: &str) -> Result<Option<TransactionLogEntry>, Error> {
        Ok(self
            .lock_entries()?
            .iter()
            .find(|e| e.transaction_id == transaction_id)
            .cloned())
    }

    /// All transactions in commit order.
    pub fn entries(&self) -> Result<Vec<TransactionLogEntry>, Error> {
        Ok(self.lock_entries()?.clone())
    }

    fn write_record(&self, record: &LogRecord) -> Result<(), Error> {
        let line = serde_json::to_string(record)?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| Error::Other("transaction log file lock poisoned".to_string()))?;
        writeln!(file, "{}", line)?;
        file.sync_all()?;
        Ok(())
    }

    fn lock_entries(&self) -> Result<MutexGuard<'_, Vec<TransactionLogEntry>>, Error> {
        self.entries
            .lock()
            .map_err(|_| Error::Other("transaction log lock poisoned".to_string()))
    }
}

fn apply(entries: &mut Vec<TransactionLogEntry>, record: LogRecord) -> Result<(), String> {
    match record {
        LogRecord::Commit(entry) => {
            if entries
                .iter()
                .any(|e| e.transaction_id == entry.transaction_id)
            {
                return Err(format!("duplicate commit for {}", entry.transaction_id));
            }
            entries.push(entry);
        }
        LogRecord::RollBack {
            transaction_id,
            timestamp,
        } => {
            let entry = entries
                .iter_mut()
                .find(|e| e.transaction_id == transaction_id)
                .ok_or_else(|| format!("rollback of unknown transaction {}", transaction_id))?;
            if entry.status == TransactionStatus::RolledBack {
                return Err(format!("transaction {} rolled back twice", transaction_id));
            }
            entry.status = TransactionStatus::RolledBack;
            entry.rolled_back_at = Some(timestamp);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> TransactionLogEntry {
        TransactionLogEntry {
            transaction_id: id.to_string(),
            group_id: 1,
            keeper_id: 1,
            keeper_path: PathBuf::from("/p/keep.jpg"),
            removed: vec![RemovedFile {
                file_id: 2,
                original_path: PathBuf::from("/p/dupe.jpg"),
                staged_path: PathBuf::from("/h/tx/files/0000-dupe.jpg"),
                size: 4,
                digest: "d".to_string(),
            }],
            metadata_before: None,
            catalog_metadata_before: MediaMetadata::default(),
            metadata_after: MediaMetadata::default(),
            committed_at: Utc::now(),
            status: TransactionStatus::Committed,
            rolled_back_at: None,
        }
    }

    #[test]
    fn test_replay_restores_commits_and_rollbacks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.jsonl");
        {
            let log = TransactionLog::open(&path).unwrap();
            log.append_commit(&entry("a")).unwrap();
            log.append_commit(&entry("b")).unwrap();
            log.append_rollback("a").unwrap();
        }
        let log = TransactionLog::open(&path).unwrap();
        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, TransactionStatus::RolledBack);
        assert!(entries[0].rolled_back_at.is_some());
        assert_eq!(entries[1].status, TransactionStatus::Committed);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.jsonl");
        {
            let log = TransactionLog::open(&path).unwrap();
            log.append_commit(&entry("a")).unwrap();
        }
        let valid_len = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"record\":\"commit\",\"transaction_id\":\"b").unwrap();
        drop(file);

        let log = TransactionLog::open(&path).unwrap();
        assert_eq!(log.entries().unwrap().len(), 1);
        assert!(log.get("b").unwrap().is_none());
        drop(log);
        assert_eq!(fs::metadata(&path).unwrap().len(), valid_len);
    }

    #[test]
    fn test_mid_file_corruption_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.jsonl");
        let good = serde_json::to_string(&LogRecord::Commit(entry("a"))).unwrap();
        fs::write(&path, format!("not json\n{}\n", good)).unwrap();

        match TransactionLog::open(&path) {
            Err(Error::CorruptLog { line, .. }) => assert_eq!(line, 1),
            Err(e) => panic!("expected CorruptLog, got {}", e),
            Ok(_) => panic!("expected CorruptLog, got a log"),
        }
    }

    #[test]
    fn test_double_rollback_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let log = TransactionLog::open(dir.path().join("tx.jsonl")).unwrap();
        log.append_commit(&entry("a")).unwrap();
        log.append_rollback("a").unwrap();
        assert!(log.append_rollback("a").is_err());
        assert!(log.append_rollback("missing").is_err());
    }
}
