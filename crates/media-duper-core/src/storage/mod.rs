//! SQLite catalog: file records, signatures and persisted duplicate groups.

pub mod models;
pub mod queries;
pub mod sqlite;

pub use models::{DetectionRun, PersistSummary};
pub use sqlite::Database;
