use std::cmp::Reverse;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Header of the display-name column in flat rows.
pub const NAME_COLUMN: &str = "Page";
/// Header of the resource identifier column in flat rows.
pub const ID_COLUMN: &str = "Page ID";
/// Header of the status column in flat rows.
pub const STATUS_COLUMN: &str = "Status";
/// Header of the comment column in flat rows.
pub const COMMENT_COLUMN: &str = "Comment";

/// Classification of a [`ResultRecord`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    /// Every metric was fetched and at least one was non-zero.
    Ok,
    /// A previously `OK` record that had missing columns backfilled.
    Updated,
    /// The resource token could not be resolved or access was denied.
    NoAccess,
    /// At least one metric failed with a transport or API error.
    ApiError,
    /// All metrics returned zero or nothing.
    NoData,
    /// No metrics were requested, or the persisted status was unreadable.
    Unknown,
}

impl RecordStatus {
    /// Whether this status means the resource could not be read.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::NoAccess | Self::ApiError | Self::Unknown)
    }

    /// Whether this status counts as a successful read.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok | Self::Updated)
    }
}

/// One resource's outcome for one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Identity key.
    pub resource_id: String,
    /// Display name at the time of the fetch.
    pub display_name: String,
    /// Metric values by column. A column without an entry was never
    /// captured and is eligible for backfill.
    pub values: BTreeMap<String, i64>,
    /// Classification.
    pub status: RecordStatus,
    /// Human-readable error summary.
    pub comment: String,
}

impl ResultRecord {
    /// A record for a resource whose token could not be resolved. Every
    /// requested column is set to zero.
    #[must_use]
    pub fn no_access(
        resource_id: impl Into<String>,
        display_name: impl Into<String>,
        columns: &[String],
        comment: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            display_name: display_name.into(),
            values: columns.iter().map(|c| (c.clone(), 0)).collect(),
            status: RecordStatus::NoAccess,
            comment: comment.into(),
        }
    }

    /// The value captured for `column`, if any.
    #[must_use]
    pub fn value(&self, column: &str) -> Option<i64> {
        self.values.get(column).copied()
    }

    /// The requested columns this record has no value for, in request order.
    #[must_use]
    pub fn missing_columns(&self, requested: &[String]) -> Vec<String> {
        requested
            .iter()
            .filter(|c| !self.values.contains_key(c.as_str()))
            .cloned()
            .collect()
    }
}

/// The persisted dataset for one window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Declared metric columns, in output order.
    pub columns: Vec<String>,
    /// Records keyed by resource id.
    pub records: BTreeMap<String, ResultRecord>,
}

impl SyncState {
    /// An empty state declaring `columns`.
    #[must_use]
    pub const fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            records: BTreeMap::new(),
        }
    }

    /// Whether the state holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The requested columns absent from the declared schema.
    #[must_use]
    pub fn missing_columns(&self, requested: &[String]) -> Vec<String> {
        requested
            .iter()
            .filter(|c| !self.columns.contains(c))
            .cloned()
            .collect()
    }

    /// Records sorted by `primary` descending. Records without a value
    /// for `primary` sort last; ties are broken by resource id.
    #[must_use]
    pub fn sorted_records(&self, primary: &str) -> Vec<&ResultRecord> {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by(|a, b| {
            Reverse(a.value(primary))
                .cmp(&Reverse(b.value(primary)))
                .then_with(|| a.resource_id.cmp(&b.resource_id))
        });
        records
    }

    /// Column headers of the flat row representation.
    #[must_use]
    pub fn headers(&self) -> Vec<String> {
        let mut headers = vec![NAME_COLUMN.to_string(), ID_COLUMN.to_string()];
        headers.extend(self.columns.iter().cloned());
        headers.push(STATUS_COLUMN.to_string());
        headers.push(COMMENT_COLUMN.to_string());
        headers
    }

    /// The records as ordered flat key/value rows, sorted by `primary`.
    /// Absent values become empty strings.
    #[must_use]
    pub fn to_rows(&self, primary: &str) -> Vec<Vec<(String, String)>> {
        self.sorted_records(primary)
            .into_iter()
            .map(|record| {
                let mut row = vec![
                    (NAME_COLUMN.to_string(), record.display_name.clone()),
                    (ID_COLUMN.to_string(), record.resource_id.clone()),
                ];
                for column in &self.columns {
                    let cell = record
                        .value(column)
                        .map_or_else(String::new, |v| v.to_string());
                    row.push((column.clone(), cell));
                }
                row.push((STATUS_COLUMN.to_string(), record.status.to_string()));
                row.push((COMMENT_COLUMN.to_string(), record.comment.clone()));
                row
            })
            .collect()
    }
}
