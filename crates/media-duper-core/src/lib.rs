pub mod config;
pub mod detection;
pub mod engine;
pub mod error;
pub mod merge;
pub mod model;
pub mod platform;
pub mod progress;
pub mod signature;
pub mod storage;

pub use config::{AppConfig, ConfigProvider, DetectionConfig, MergeConfig};
pub use detection::{DuplicateGroup, GroupMember, MatchClass, PairwiseScore};
pub use engine::{DetectionEngine, DetectionReport, DetectionStats};
pub use error::Error;
pub use merge::{MergePlan, MergeService, TransactionLogEntry, TransactionStatus};
pub use progress::{GroupSink, ProgressReporter, SilentReporter};
