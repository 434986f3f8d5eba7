#[cfg(target_os = "windows")]
pub mod windows;

use std::io;
use std::path::Path;

/// Opaque identifier of the volume holding `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeId {
    Device(u64),
    Drive(String),
    Unknown,
}

#[cfg(unix)]
pub fn volume_id(path: &Path) -> io::Result<VolumeId> {
    use std::os::unix::fs::MetadataExt;
    Ok(VolumeId::Device(std::fs::metadata(path)?.dev()))
}

#[cfg(target_os = "windows")]
pub fn volume_id(path: &Path) -> io::Result<VolumeId> {
    let canonical = std::fs::canonicalize(path)?;
    Ok(windows::get_drive_letter(&canonical)
        .map(|drive| VolumeId::Drive(drive.to_string_lossy().to_uppercase()))
        .unwrap_or(VolumeId::Unknown))
}

#[cfg(not(any(unix, target_os = "windows")))]
pub fn volume_id(_path: &Path) -> io::Result<VolumeId> {
    Ok(VolumeId::Unknown)
}

/// Whether a rename from `src` into the directory `dest_dir` stays on one volume.
/// Unknown volumes are treated as different.
pub fn same_volume(src: &Path, dest_dir: &Path) -> bool {
    match (volume_id(src), volume_id(dest_dir)) {
        (Ok(VolumeId::Unknown), _) | (_, Ok(VolumeId::Unknown)) => false,
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Rename failed because source and destination are on different devices.
pub fn is_cross_device_error(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(18) => true, // POSIX EXDEV
        Some(17) if cfg!(target_os = "windows") => true, // ERROR_NOT_SAME_DEVICE
        _ => false,
    }
}
