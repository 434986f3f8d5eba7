use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub type FileId = i64;
pub type GroupId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
        }
    }

    /// Whether this media type carries a playback duration.
    pub fn is_timed(&self) -> bool {
        matches!(self, MediaType::Video | MediaType::Audio)
    }

    /// Whether this media type carries pixel dimensions.
    pub fn is_visual(&self) -> bool {
        matches!(self, MediaType::Image | MediaType::Video)
    }
}

impl FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaType::Image),
            "video" => Ok(MediaType::Video),
            "audio" => Ok(MediaType::Audio),
            other => Err(format!("unknown media type '{}'", other)),
        }
    }
}

/// A media file as tracked by the external scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub path: PathBuf,
    pub size: u64,
    pub created_at: Option<i64>,
    pub modified_at: i64,
    pub media_type: MediaType,
    pub metadata: MediaMetadata,
}

impl FileRecord {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaMetadata {
    /// Capture timestamp, seconds since the Unix epoch.
    pub capture_date: Option<i64>,
    pub keywords: Vec<String>,
    pub gps: Option<GpsCoordinate>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub technical: Option<TechnicalMetadata>,
}

impl MediaMetadata {
    /// Number of populated descriptive fields (date, GPS, camera).
    pub fn completeness(&self) -> u8 {
        let mut score = 0;
        if self.capture_date.is_some() {
            score += 1;
        }
        if self.gps.is_some() {
            score += 1;
        }
        if self.camera_make.is_some() || self.camera_model.is_some() {
            score += 1;
        }
        score
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsCoordinate {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
}

impl GpsCoordinate {
    pub fn completeness(&self) -> u8 {
        if self.altitude.is_some() {
            3
        } else {
            2
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TechnicalMetadata {
    pub codec: Option<String>,
    pub bit_depth: Option<u8>,
    pub color_space: Option<String>,
    pub bitrate_kbps: Option<u32>,
    pub iso: Option<u32>,
    pub lens_model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashFamily {
    AHash,
    DHash,
    PHash,
    /// Per-frame hash sampled from video.
    Frame,
    /// Chromaprint-style audio fingerprint.
    Chroma,
}

impl HashFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashFamily::AHash => "ahash",
            HashFamily::DHash => "dhash",
            HashFamily::PHash => "phash",
            HashFamily::Frame => "frame",
            HashFamily::Chroma => "chroma",
        }
    }
}

/// Hash family plus version. Hashes are only comparable when both match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HashAlgorithm {
    pub family: HashFamily,
    pub version: u16,
}

impl HashAlgorithm {
    pub const fn new(family: HashFamily, version: u16) -> Self {
        Self { family, version }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-v{}", self.family.as_str(), self.version)
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (family, version) = s
            .rsplit_once("-v")
            .ok_or_else(|| format!("malformed hash algorithm tag '{}'", s))?;
        let family = match family {
            "ahash" => HashFamily::AHash,
            "dhash" => HashFamily::DHash,
            "phash" => HashFamily::PHash,
            "frame" => HashFamily::Frame,
            "chroma" => HashFamily::Chroma,
            other => return Err(format!("unknown hash family '{}'", other)),
        };
        let version = version
            .parse::<u16>()
            .map_err(|e| format!("bad hash version in '{}': {}", s, e))?;
        Ok(HashAlgorithm { family, version })
    }
}

/// Fixed-length perceptual signature, bits packed most-significant first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerceptualHash {
    pub algorithm: HashAlgorithm,
    pub bits: Vec<u8>,
    pub bit_length: u32,
}

impl PerceptualHash {
    pub fn from_u64(algorithm: HashAlgorithm, value: u64) -> Self {
        Self {
            algorithm,
            bits: value.to_be_bytes().to_vec(),
            bit_length: 64,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.bit_length > 0 && self.bits.len() == (self.bit_length as usize).div_ceil(8)
    }

    /// Number of differing bits, or `None` when lengths differ.
    pub fn hamming_distance(&self, other: &PerceptualHash) -> Option<u32> {
        if self.bit_length != other.bit_length || self.bits.len() != other.bits.len() {
            return None;
        }
        let tail = self.bit_length % 8;
        let last = self.bits.len().saturating_sub(1);
        let distance = self
            .bits
            .iter()
            .zip(&other.bits)
            .enumerate()
            .map(|(i, (a, b))| {
                let mut diff = a ^ b;
                if i == last && tail != 0 {
                    diff &= 0xFFu8 << (8 - tail);
                }
                diff.count_ones()
            })
            .sum();
        Some(distance)
    }

    /// `1 - distance / bit_length`, clipped to [0, 1].
    pub fn similarity(&self, other: &PerceptualHash) -> Option<f64> {
        let distance = self.hamming_distance(other)?;
        let ratio = 1.0 - distance as f64 / self.bit_length as f64;
        Some(ratio.clamp(0.0, 1.0))
    }

    pub fn bit(&self, index: u32) -> bool {
        let byte = self.bits[(index / 8) as usize];
        byte & (0x80 >> (index % 8)) != 0
    }

    /// Packs bits `[start, end)` into an integer. Bands wider than 64 bits keep
    /// only the trailing 64.
    pub fn band(&self, start: u32, end: u32) -> u64 {
        (start..end.min(self.bit_length)).fold(0u64, |acc, i| (acc << 1) | self.bit(i) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// Read-only per-file signature produced by the external hashing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub checksum: Option<String>,
    /// One hash for stills and audio; one per sampled frame for video.
    pub perceptual_hashes: Vec<PerceptualHash>,
    pub dimensions: Option<Dimensions>,
    pub duration_ms: Option<u64>,
    pub computed_at: i64,
}

impl Signature {
    pub fn primary_hash(&self) -> Option<&PerceptualHash> {
        self.perceptual_hashes.first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Open,
    Resolved,
    Dismissed,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Open => "open",
            GroupStatus::Resolved => "resolved",
            GroupStatus::Dismissed => "dismissed",
        }
    }
}

impl FromStr for GroupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(GroupStatus::Open),
            "resolved" => Ok(GroupStatus::Resolved),
            "dismissed" => Ok(GroupStatus::Dismissed),
            other => Err(format!("unknown group status '{}'", other)),
        }
    }
}
