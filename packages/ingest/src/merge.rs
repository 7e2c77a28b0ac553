//! Reconciles freshly fetched records with a persisted window.
//!
//! Resources are identified by id only. A resource already present keeps
//! every value it has; fresh values are only copied into columns it is
//! missing. Resources absent from the fresh batch are kept as they are.

use std::collections::BTreeSet;

use insight_sync_metrics_models::{RecordStatus, ResultRecord, SyncState};

/// Errors from merging.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    /// The fresh batch contains the same resource twice.
    #[error("Resource {resource_id} appears more than once in the fetched batch")]
    DuplicateResource {
        /// The duplicated id.
        resource_id: String,
    },
}

/// The merged state plus what changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The merged state.
    pub state: SyncState,
    /// Ids inserted as new rows.
    pub inserted: Vec<String>,
    /// Ids that had missing columns backfilled.
    pub updated: Vec<String>,
    /// Ids whose backfill fetch failed; their missing columns stay absent.
    pub backfill_failed: Vec<String>,
}

/// Merges `fresh` into `existing`.
///
/// The resulting schema lists `requested` first, followed by any other
/// column the existing state already declared.
///
/// # Errors
///
/// Returns [`MergeError::DuplicateResource`] if `fresh` contains the same
/// resource id more than once.
pub fn merge(
    existing: SyncState,
    fresh: Vec<ResultRecord>,
    requested: &[String],
) -> Result<MergeOutcome, MergeError> {
    let mut seen = BTreeSet::new();
    for record in &fresh {
        if !seen.insert(record.resource_id.as_str()) {
            return Err(MergeError::DuplicateResource {
                resource_id: record.resource_id.clone(),
            });
        }
    }

    let mut columns = requested.to_vec();
    columns.extend(
        existing
            .columns
            .iter()
            .filter(|c| !requested.contains(c))
            .cloned(),
    );

    let mut records = existing.records;
    let mut inserted = Vec::new();
    let mut updated = Vec::new();
    let mut backfill_failed = Vec::new();

    for record in fresh {
        let Some(current) = records.get_mut(&record.resource_id) else {
            inserted.push(record.resource_id.clone());
            records.insert(record.resource_id.clone(), record);
            continue;
        };

        let missing = current.missing_columns(requested);
        if missing.is_empty() {
            continue;
        }
        if record.status.is_failure() {
            log::debug!(
                "Backfill of {} failed ({}), leaving {} empty",
                current.display_name,
                record.status,
                missing.join(", ")
            );
            backfill_failed.push(record.resource_id);
            continue;
        }

        let mut filled = false;
        for column in &missing {
            if let Some(value) = record.value(column) {
                current.values.insert(column.clone(), value);
                filled = true;
            }
        }
        if filled {
            if current.status == RecordStatus::Ok {
                current.status = RecordStatus::Updated;
            }
            updated.push(record.resource_id);
        }
    }

    Ok(MergeOutcome {
        state: SyncState { columns, records },
        inserted,
        updated,
        backfill_failed,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn record(id: &str, values: &[(&str, i64)], status: RecordStatus) -> ResultRecord {
        ResultRecord {
            resource_id: id.to_string(),
            display_name: format!("Page {id}"),
            values: values
                .iter()
                .map(|(k, v)| ((*k).to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
            status,
            comment: String::new(),
        }
    }

    fn state(columns: &[&str], records: Vec<ResultRecord>) -> SyncState {
        let mut state = SyncState::new(cols(columns));
        for r in records {
            state.records.insert(r.resource_id.clone(), r);
        }
        state
    }

    #[test]
    fn inserts_new_and_retains_vanished_resources() {
        let existing = state(&["Reach"], vec![record("old", &[("Reach", 5)], RecordStatus::Ok)]);
        let fresh = vec![record("new", &[("Reach", 9)], RecordStatus::Ok)];

        let outcome = merge(existing, fresh, &cols(&["Reach"])).unwrap();

        assert_eq!(outcome.inserted, vec!["new"]);
        assert!(outcome.state.records.contains_key("old"));
        assert_eq!(outcome.state.records.len(), 2);
    }

    #[test]
    fn backfills_only_missing_columns() {
        let existing = state(&["Reach"], vec![record("a", &[("Reach", 100)], RecordStatus::Ok)]);
        let fresh = vec![record(
            "a",
            &[("Reach", 999), ("Publications", 4)],
            RecordStatus::Ok,
        )];

        let outcome = merge(existing, fresh, &cols(&["Reach", "Publications"])).unwrap();
        let merged = &outcome.state.records["a"];

        assert_eq!(merged.value("Reach"), Some(100));
        assert_eq!(merged.value("Publications"), Some(4));
        assert_eq!(merged.status, RecordStatus::Updated);
        assert_eq!(outcome.updated, vec!["a"]);
        assert_eq!(outcome.state.columns, cols(&["Reach", "Publications"]));
    }

    #[test]
    fn terminal_statuses_are_not_promoted() {
        let existing = state(
            &["Reach"],
            vec![record("a", &[("Reach", 0)], RecordStatus::NoData)],
        );
        let fresh = vec![record("a", &[("Publications", 2)], RecordStatus::Ok)];

        let outcome = merge(existing, fresh, &cols(&["Reach", "Publications"])).unwrap();
        let merged = &outcome.state.records["a"];

        assert_eq!(merged.status, RecordStatus::NoData);
        assert_eq!(merged.value("Publications"), Some(2));
    }

    #[test]
    fn failed_backfill_leaves_column_absent() {
        let existing = state(&["Reach"], vec![record("a", &[("Reach", 7)], RecordStatus::Ok)]);
        let fresh = vec![record("a", &[("Publications", 0)], RecordStatus::ApiError)];

        let outcome = merge(existing, fresh, &cols(&["Reach", "Publications"])).unwrap();
        let merged = &outcome.state.records["a"];

        assert_eq!(merged.value("Publications"), None);
        assert_eq!(merged.status, RecordStatus::Ok);
        assert_eq!(outcome.backfill_failed, vec!["a"]);
    }

    #[test]
    fn complete_records_are_left_alone() {
        let existing = state(&["Reach"], vec![record("a", &[("Reach", 7)], RecordStatus::Ok)]);
        let fresh = vec![record("a", &[("Reach", 8)], RecordStatus::Ok)];

        let outcome = merge(existing.clone(), fresh, &cols(&["Reach"])).unwrap();

        assert_eq!(outcome.state, existing);
        assert!(outcome.updated.is_empty());
    }

    #[test]
    fn keeps_extra_persisted_columns_after_requested() {
        let existing = state(&["Legacy", "Reach"], Vec::new());
        let outcome = merge(existing, Vec::new(), &cols(&["Reach"])).unwrap();
        assert_eq!(outcome.state.columns, cols(&["Reach", "Legacy"]));
    }

    #[test]
    fn duplicate_fresh_records_fail_loudly() {
        let fresh = vec![
            record("a", &[("Reach", 1)], RecordStatus::Ok),
            record("a", &[("Reach", 2)], RecordStatus::Ok),
        ];
        assert_eq!(
            merge(SyncState::default(), fresh, &cols(&["Reach"])),
            Err(MergeError::DuplicateResource {
                resource_id: "a".to_string()
            })
        );
    }
}
