use crate::error::Error;
use crate::model::GroupId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Advisory per-group merge locks: an in-process table backed by a lock file
/// per group, so two processes sharing a holding area also exclude each other.
#[derive(Debug, Clone)]
pub struct GroupLocks {
    dir: PathBuf,
    held: Arc<DashMap<GroupId, ()>>,
}

/// Releases the group lock on drop.
#[derive(Debug)]
pub struct GroupLockGuard {
    group_id: GroupId,
    file: File,
    held: Arc<DashMap<GroupId, ()>>,
}

impl GroupLocks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            held: Arc::new(DashMap::new()),
        }
    }

    /// Never blocks: a group already being merged yields `Error::GroupBusy`.
    pub fn try_acquire(&self, group_id: GroupId) -> Result<GroupLockGuard, Error> {
        match self.held.entry(group_id) {
            Entry::Occupied(_) => return Err(Error::GroupBusy(group_id)),
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let file = match self.lock_file(group_id) {
            Ok(file) => file,
            Err(e) => {
                self.held.remove(&group_id);
                return Err(e);
            }
        };
        debug!(group_id, "Acquired merge lock");
        Ok(GroupLockGuard {
            group_id,
            file,
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, group_id: GroupId) -> bool {
        self.held.contains_key(&group_id)
    }

    fn lock_file(&self, group_id: GroupId) -> Result<File, Error> {
        std::fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.dir.join(format!("group-{}.lock", group_id)))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(file),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(Error::GroupBusy(group_id))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for GroupLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(group_id = self.group_id, "Unlocking merge lock failed: {}", e);
        }
        self.held.remove(&self.group_id);
        debug!(group_id = self.group_id, "Released merge lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_busy_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let locks = GroupLocks::new(dir.path());

        let guard = locks.try_acquire(4).unwrap();
        assert!(matches!(locks.try_acquire(4), Err(Error::GroupBusy(4))));
        assert!(locks.try_acquire(5).is_ok());

        drop(guard);
        assert!(!locks.is_held(4));
        assert!(locks.try_acquire(4).is_ok());
    }

    #[test]
    fn test_separate_tables_contend_through_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = GroupLocks::new(dir.path());
        let second = GroupLocks::new(dir.path());

        let _guard = first.try_acquire(9).unwrap();
        assert!(matches!(second.try_acquire(9), Err(Error::GroupBusy(9))));
        assert!(!second.is_held(9));
    }
}
