//! Filesystem primitives used by the merge transaction.

use crate::platform;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const COPY_BUFFER: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMethod {
    Rename,
    /// Copied, verified by digest, then the source was deleted.
    CopyVerified,
}

/// Moves `src` to `dest` without ever overwriting an existing file.
///
/// Same-volume moves are a single rename. Otherwise the file is copied,
/// flushed, verified against the source digest and only then is the source
/// removed; a copy exceeding `timeout` is abandoned with the source intact.
pub fn move_file(src: &Path, dest: &Path, timeout: Duration) -> io::Result<MoveMethod> {
    if dest.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("destination {} already exists", dest.display()),
        ));
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let parent = dest.parent().unwrap_or(Path::new("."));
    if platform::same_volume(src, parent) {
        match fs::rename(src, dest) {
            Ok(()) => {
                sync_parents(src, dest);
                return Ok(MoveMethod::Rename);
            }
            Err(err) if platform::is_cross_device_error(&err) => {
                debug!("Rename of {} crossed devices, copying", src.display());
            }
            Err(err) => return Err(err),
        }
    }

    copy_verified(src, dest, Instant::now() + timeout)?;
    fs::remove_file(src)?;
    sync_parents(src, dest);
    Ok(MoveMethod::CopyVerified)
}

/// Copies `src` to a new file at `dest`, fsyncs it and checks the copy's digest.
/// On any failure the partial copy is removed.
pub fn copy_verified(src: &Path, dest: &Path, deadline: Instant) -> io::Result<String> {
    let result = copy_and_hash(src, dest, deadline).and_then(|source_digest| {
        let copy_digest = file_digest(dest)?;
        if copy_digest != source_digest {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "copy of {} does not match the source ({} != {})",
                    src.display(),
                    copy_digest,
                    source_digest
                ),
            ));
        }
        Ok(source_digest)
    });
    if result.is_err() {
        if let Err(e) = fs::remove_file(dest) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Could not remove partial copy {}: {}", dest.display(), e);
            }
        }
    }
    result
}

fn copy_and_hash(src: &Path, dest: &Path, deadline: Instant) -> io::Result<String> {
    let mut input = File::open(src)?;
    let mut output = File::options().write(true).create_new(true).open(dest)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; COPY_BUFFER];

    loop {
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("copy of {} timed out", src.display()),
            ));
        }
        let read = input.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        output.write_all(&buffer[..read])?;
    }
    output.sync_all()?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Hex blake3 digest of a file's content.
pub fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; COPY_BUFFER];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Replaces `path` with `bytes` through a synced temp file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fsync_dir(parent)
}

#[cfg(unix)]
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub fn fsync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn sync_parents(src: &Path, dest: &Path) {
    for dir in [src.parent(), dest.parent()].into_iter().flatten() {
        if let Err(e) = fsync_dir(dir) {
            warn!("fsync of {} failed: {}", dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_renames_within_volume() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.jpg");
        let dest = dir.path().join("nested/b.jpg");
        fs::write(&src, b"pixels").unwrap();

        let method = move_file(&src, &dest, Duration::from_secs(5)).unwrap();
        assert_eq!(method, MoveMethod::Rename);
        assert!(!src.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"pixels");
    }

    #[test]
    fn test_move_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.jpg");
        let dest = dir.path().join("b.jpg");
        fs::write(&src, b"new").unwrap();
        fs::write(&dest, b"old").unwrap();

        let err = move_file(&src, &dest, Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&dest).unwrap(), b"old");
        assert!(src.exists());
    }

    #[test]
    fn test_copy_verified_matches_source_digest() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("clip.mp4");
        let dest = dir.path().join("copy.mp4");
        fs::write(&src, vec![7u8; 600_000]).unwrap();

        let digest = copy_verified(&src, &dest, Instant::now() + Duration::from_secs(30)).unwrap();
        assert_eq!(digest, file_digest(&src).unwrap());
        assert!(src.exists());
    }

    #[test]
    fn test_copy_past_deadline_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("clip.mp4");
        let dest = dir.path().join("copy.mp4");
        fs::write(&src, b"frames").unwrap();

        let err = copy_verified(&src, &dest, Instant::now()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(!dest.exists());
        assert!(src.exists());
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        write_atomic(&path, b"{}").unwrap();
        write_atomic(&path, b"{\"a\":1}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"a\":1}");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
