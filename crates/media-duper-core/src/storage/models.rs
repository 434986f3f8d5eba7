use crate::model::GroupId;
use rusqlite::types::Type;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// One persisted invocation of detection.
#[derive(Debug, Clone)]
pub struct DetectionRun {
    pub id: i64,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub files: i64,
    pub groups_found: i64,
    pub groups_skipped: i64,
    pub hash_comparisons: i64,
    pub diagnostics: i64,
}

/// Outcome of persisting a detection report.
#[derive(Debug, Clone, Default)]
pub struct PersistSummary {
    pub run_id: i64,
    /// Catalog ids of inserted groups, in report order.
    pub group_ids: Vec<GroupId>,
    /// Report ordinals of groups rejected because a member was already in an
    /// open group.
    pub skipped: Vec<GroupId>,
    /// Open groups from earlier runs that were dismissed.
    pub dismissed: usize,
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

pub(crate) fn from_json<T: DeserializeOwned>(column: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

pub(crate) fn parse_column<T>(column: usize, text: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    text.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, Type::Text, e.into())
    })
}
