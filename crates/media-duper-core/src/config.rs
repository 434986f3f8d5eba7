use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: String,
    pub detection: DetectionConfig,
    pub merge: MergeConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: "media_duper.db".to_string(),
            detection: DetectionConfig::default(),
            merge: MergeConfig::default(),
        }
    }
}

/// Thresholds, tolerances and weights for the detection phase.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub duplicate_threshold: f64,
    pub similar_threshold: f64,
    /// Pairs scoring below this are reported as no-match.
    pub admission_floor: f64,
    /// Transitively linked members scoring below this directly flag their group.
    pub divergence_floor: f64,
    /// Minimum primary-hash similarity for a pair to be scored at all.
    pub visual_floor: f64,
    pub duration_tolerance_secs: f64,
    pub capture_date_tolerance_secs: i64,
    pub capture_date_decay_secs: f64,
    pub aspect_tolerance: f64,
    pub dimension_tolerance: f64,
    /// Relative overlap used when assigning numeric bucket windows.
    pub window_overlap: f64,
    pub duration_window_ratio: f64,
    pub aspect_window_ratio: f64,
    pub max_bucket_size: usize,
    /// 0 uses the rayon default.
    pub worker_threads: usize,
    pub weights: SignalWeights,
    pub penalties: PenaltyFactors,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            duplicate_threshold: 0.85,
            similar_threshold: 0.60,
            admission_floor: 0.40,
            divergence_floor: 0.50,
            visual_floor: 0.75,
            duration_tolerance_secs: 2.0,
            capture_date_tolerance_secs: 2,
            capture_date_decay_secs: 3600.0,
            aspect_tolerance: 0.02,
            dimension_tolerance: 0.02,
            window_overlap: 0.02,
            duration_window_ratio: 2.0,
            aspect_window_ratio: 1.10,
            max_bucket_size: 512,
            worker_threads: 0,
            weights: SignalWeights::default(),
            penalties: PenaltyFactors::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct SignalWeights {
    pub visual: f64,
    pub capture_date: f64,
    pub filename: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            visual: 0.70,
            capture_date: 0.20,
            filename: 0.10,
        }
    }
}

/// Multiplicative factors applied when structural signals disagree.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct PenaltyFactors {
    pub dimension: f64,
    pub aspect: f64,
    pub duration: f64,
    pub frame_count: f64,
}

impl Default for PenaltyFactors {
    fn default() -> Self {
        Self {
            dimension: 0.95,
            aspect: 0.80,
            duration: 0.85,
            frame_count: 0.90,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MergeConfig {
    pub holding_dir: PathBuf,
    pub transaction_log_path: PathBuf,
    pub retention_days: u64,
    pub max_concurrent_merges: usize,
    pub copy_timeout_secs: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            holding_dir: PathBuf::from("holding"),
            transaction_log_path: PathBuf::from("transactions.jsonl"),
            retention_days: 30,
            max_concurrent_merges: 2,
            copy_timeout_secs: 300,
        }
    }
}

impl MergeConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }

    pub fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout_secs)
    }
}

/// Supplies runtime-overridable detection and merge settings.
pub trait ConfigProvider {
    fn detection_config(&self) -> DetectionConfig;
    fn merge_config(&self) -> MergeConfig;
}

impl ConfigProvider for AppConfig {
    fn detection_config(&self) -> DetectionConfig {
        self.detection.clone()
    }

    fn merge_config(&self) -> MergeConfig {
        self.merge.clone()
    }
}

/// Load `MediaDuper.{toml,json,yaml}` (optional) overlaid by `MEDIA_DUPER__*`
/// environment variables, e.g. `MEDIA_DUPER__DETECTION__DUPLICATE_THRESHOLD=0.9`.
pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("MediaDuper").required(false))
        .add_source(Environment::with_prefix("MEDIA_DUPER").separator("__"))
        .build()?;
    let config = builder.try_deserialize::<AppConfig>()?;
    config.validate()?;
    Ok(config)
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.detection.validate()?;
        if self.merge.max_concurrent_merges == 0 {
            return Err(ConfigError::Message(
                "merge.max_concurrent_merges must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = [
            ("duplicate_threshold", self.duplicate_threshold),
            ("similar_threshold", self.similar_threshold),
            ("admission_floor", self.admission_floor),
            ("divergence_floor", self.divergence_floor),
            ("visual_floor", self.visual_floor),
            ("penalties.dimension", self.penalties.dimension),
            ("penalties.aspect", self.penalties.aspect),
            ("penalties.duration", self.penalties.duration),
            ("penalties.frame_count", self.penalties.frame_count),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Message(format!(
                    "detection.{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.similar_threshold > self.duplicate_threshold {
            return Err(ConfigError::Message(format!(
                "detection.similar_threshold ({}) exceeds duplicate_threshold ({})",
                self.similar_threshold, self.duplicate_threshold
            )));
        }
        let w = &self.weights;
        if w.visual < 0.0 || w.capture_date < 0.0 || w.filename < 0.0 {
            return Err(ConfigError::Message(
                "detection.weights must be non-negative".to_string(),
            ));
        }
        if w.visual <= 0.0 {
            return Err(ConfigError::Message(
                "detection.weights.visual must be positive".to_string(),
            ));
        }
        if self.duration_window_ratio <= 1.0 || self.aspect_window_ratio <= 1.0 {
            return Err(ConfigError::Message(
                "detection window ratios must be greater than 1".to_string(),
            ));
        }
        if self.max_bucket_size < 2 {
            return Err(ConfigError::Message(
                "detection.max_bucket_size must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.detection.duplicate_threshold, 0.85);
        assert_eq!(config.detection.similar_threshold, 0.60);
        assert_eq!(config.merge.retention(), Duration::from_secs(30 * 86_400));
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut config = AppConfig::default();
        config.detection.similar_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_visual_weight() {
        let mut config = AppConfig::default();
        config.detection.weights.visual = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let loaded: AppConfig = Config::builder()
            .add_source(config::File::from_str(
                "[detection]\nduplicate_threshold = 0.9\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(loaded.detection.duplicate_threshold, 0.9);
        assert_eq!(loaded.detection.similar_threshold, 0.60);
        assert_eq!(loaded.merge.max_concurrent_merges, 2);
    }
}
