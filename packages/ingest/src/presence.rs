//! Month-over-month presence report.
//!
//! Compares the resources of a window with those of the previous month
//! and lists pages that appeared, pages that disappeared, and current
//! rows that could not be read.

use insight_sync_metrics_models::{RecordStatus, ResultRecord, SyncState, WindowKey};
use strum_macros::{AsRefStr, Display, EnumString};

/// Header of the change column in a persisted presence report.
pub const CHANGE_COLUMN: &str = "Change";

/// Why a resource is listed in a presence report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceChange {
    /// Present now, absent from the previous window.
    New,
    /// Present in the previous window, absent now.
    Dropped,
    /// Present now with a status other than `OK`/`UPDATED`.
    Flagged,
}

/// One line of a presence report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub resource_id: String,
    pub display_name: String,
    pub change: PresenceChange,
    /// Status in the window the resource was last seen in.
    pub status: RecordStatus,
    pub comment: String,
}

/// Differences between a window and the one before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceReport {
    pub window: WindowKey,
    pub previous: WindowKey,
    /// Entries grouped by change, then ordered by display name.
    pub entries: Vec<PresenceEntry>,
}

impl PresenceReport {
    /// Number of entries with the given change.
    #[must_use]
    pub fn count(&self, change: PresenceChange) -> usize {
        self.entries.iter().filter(|e| e.change == change).count()
    }
}

/// Builds the presence report of `current` against `previous`.
#[must_use]
pub fn compare(
    previous: &SyncState,
    current: &SyncState,
    window: WindowKey,
    previous_key: WindowKey,
) -> PresenceReport {
    let mut entries = Vec::new();

    for record in current.records.values() {
        if !previous.records.contains_key(&record.resource_id) {
            entries.push(entry(record, PresenceChange::New));
        }
        if !record.status.is_ok() {
            entries.push(entry(record, PresenceChange::Flagged));
        }
    }
    for record in previous.records.values() {
        if !current.records.contains_key(&record.resource_id) {
            entries.push(entry(record, PresenceChange::Dropped));
        }
    }

    entries.sort_by(|a, b| {
        a.change
            .cmp(&b.change)
            .then_with(|| a.display_name.cmp(&b.display_name))
            .then_with(|| a.resource_id.cmp(&b.resource_id))
    });

    PresenceReport {
        window,
        previous: previous_key,
        entries,
    }
}

fn entry(record: &ResultRecord, change: PresenceChange) -> PresenceEntry {
    PresenceEntry {
        resource_id: record.resource_id.clone(),
        display_name: record.display_name.clone(),
        change,
        status: record.status,
        comment: record.comment.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(rows: &[(&str, RecordStatus)]) -> SyncState {
        let mut state = SyncState::new(vec!["Reach".to_string()]);
        for (id, status) in rows {
            state.records.insert(
                (*id).to_string(),
                ResultRecord {
                    resource_id: (*id).to_string(),
                    display_name: format!("Page {id}"),
                    values: [("Reach".to_string(), 1)].into_iter().collect(),
                    status: *status,
                    comment: String::new(),
                },
            );
        }
        state
    }

    #[test]
    fn lists_new_dropped_and_flagged_resources() {
        let previous = state(&[("a", RecordStatus::Ok), ("gone", RecordStatus::Ok)]);
        let current = state(&[
            ("a", RecordStatus::Ok),
            ("fresh", RecordStatus::Ok),
            ("locked", RecordStatus::NoAccess),
        ]);
        let jan = WindowKey::Month { year: 2025, month: 1 };
        let feb = WindowKey::Month { year: 2025, month: 2 };

        let report = compare(&previous, &current, feb, jan);

        let summary: Vec<_> = report
            .entries
            .iter()
            .map(|e| (e.change, e.resource_id.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (PresenceChange::New, "fresh"),
                (PresenceChange::New, "locked"),
                (PresenceChange::Dropped, "gone"),
                (PresenceChange::Flagged, "locked"),
            ]
        );
        assert_eq!(report.count(PresenceChange::New), 2);
    }

    #[test]
    fn updated_rows_are_not_flagged() {
        let previous = state(&[("a", RecordStatus::Ok)]);
        let current = state(&[("a", RecordStatus::Updated)]);
        let key = WindowKey::Month { year: 2025, month: 2 };
        assert!(compare(&previous, &current, key, key.previous_month()).entries.is_empty());
    }

    #[test]
    fn change_labels_are_screaming_case() {
        assert_eq!(PresenceChange::Dropped.to_string(), "DROPPED");
        assert_eq!("NEW".parse::<PresenceChange>().unwrap(), PresenceChange::New);
    }
}
