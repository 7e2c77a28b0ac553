//! CSV file store for window record sets.
//!
//! Every window is persisted as one CSV file in the output directory,
//! named after the window key (`{prefix}_2025_01.csv`, `{prefix}_2025_W03.csv`).
//! The header row is the declared schema: the metric columns are every
//! header other than the fixed name/id/status/comment columns, so a file
//! written before a metric was added loads without that column and the
//! engine backfills it.
//!
//! Writes go to a temporary file in the same directory which is synced and
//! then renamed over the target, so an interrupted run never leaves a
//! half-written window behind.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use insight_sync_metrics_models::{
    COMMENT_COLUMN, ID_COLUMN, NAME_COLUMN, RecordStatus, ResultRecord, STATUS_COLUMN, SyncState,
    WindowKey,
};

use crate::presence::{CHANGE_COLUMN, PresenceReport};

/// Errors from reading or writing persisted windows.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// I/O error (file read/write/rename).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding or decoding failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A persisted file does not have the expected layout.
    #[error("Invalid record set {path}: {message}")]
    Schema {
        /// File that failed to load.
        path: String,
        /// What is wrong with it.
        message: String,
    },

    /// A persisted file lists the same resource twice.
    #[error("Resource {resource_id} appears more than once in {path}")]
    DuplicateResource {
        /// File that failed to load.
        path: String,
        /// The duplicated id.
        resource_id: String,
    },
}

/// Persists one CSV file per window in a directory.
#[derive(Debug, Clone)]
pub struct CsvSink {
    dir: PathBuf,
    prefix: String,
}

impl CsvSink {
    /// Creates a sink writing `{prefix}_*.csv` files into `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// The output directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record set for `key`.
    #[must_use]
    pub fn path_for(&self, key: WindowKey) -> PathBuf {
        self.dir
            .join(format!("{}_{}.csv", self.prefix, file_stem(key)))
    }

    /// Path of the presence report for `key`.
    #[must_use]
    pub fn status_path_for(&self, key: WindowKey) -> PathBuf {
        self.dir
            .join(format!("{}_STATUS_{}.csv", self.prefix, file_stem(key)))
    }

    /// Loads the persisted record set for `key`, or `None` if the window
    /// has never been written.
    ///
    /// Empty cells load as absent values. Unreadable numbers are treated as
    /// absent and unreadable statuses as `UNKNOWN`, both with a warning.
    ///
    /// # Errors
    ///
    /// * [`SinkError::Schema`] if the id column is missing
    /// * [`SinkError::DuplicateResource`] if an id occurs twice
    /// * [`SinkError::Io`] / [`SinkError::Csv`] if the file cannot be read
    pub fn load(&self, key: WindowKey) -> Result<Option<SyncState>, SinkError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }

        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(&path)?;
        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_owned())
            .collect();

        let position = |name: &str| headers.iter().position(|h| h == name);
        let Some(id_idx) = position(ID_COLUMN) else {
            return Err(SinkError::Schema {
                path: path.display().to_string(),
                message: format!("missing '{ID_COLUMN}' column"),
            });
        };
        let name_idx = position(NAME_COLUMN);
        let status_idx = position(STATUS_COLUMN);
        let comment_idx = position(COMMENT_COLUMN);

        let metric_columns: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                *i != id_idx
                    && Some(*i) != name_idx
                    && Some(*i) != status_idx
                    && Some(*i) != comment_idx
            })
            .map(|(i, h)| (i, h.clone()))
            .collect();

        let mut state = SyncState::new(metric_columns.iter().map(|(_, c)| c.clone()).collect());

        for (line, result) in reader.records().enumerate() {
            let row = result?;
            let cell = |idx: Option<usize>| idx.and_then(|i| row.get(i)).unwrap_or("").trim();

            let resource_id = cell(Some(id_idx)).to_owned();
            if resource_id.is_empty() {
                log::warn!("{}: skipping row {} without id", path.display(), line + 2);
                continue;
            }
            if state.records.contains_key(&resource_id) {
                return Err(SinkError::DuplicateResource {
                    path: path.display().to_string(),
                    resource_id,
                });
            }

            let mut values = BTreeMap::new();
            for (idx, column) in &metric_columns {
                let raw = cell(Some(*idx));
                if raw.is_empty() {
                    continue;
                }
                match raw.parse::<i64>() {
                    Ok(v) => {
                        values.insert(column.clone(), v);
                    }
                    Err(_) => log::warn!(
                        "{}: {resource_id} has unreadable {column} value '{raw}', treating as missing",
                        path.display()
                    ),
                }
            }

            let status = cell(status_idx).parse().unwrap_or_else(|_| {
                log::warn!(
                    "{}: {resource_id} has unreadable status '{}'",
                    path.display(),
                    cell(status_idx)
                );
                RecordStatus::Unknown
            });

            state.records.insert(
                resource_id.clone(),
                ResultRecord {
                    display_name: cell(name_idx).to_owned(),
                    resource_id,
                    values,
                    status,
                    comment: cell(comment_idx).to_owned(),
                },
            );
        }

        log::debug!(
            "Loaded {} record(s) from {}",
            state.records.len(),
            path.display()
        );
        Ok(Some(state))
    }

    /// Writes `state` for `key`, sorted by `primary` descending, replacing
    /// any previous file atomically.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the directory, temporary file, or rename
    /// fails.
    pub fn persist(
        &self,
        key: WindowKey,
        state: &SyncState,
        primary: &str,
    ) -> Result<PathBuf, SinkError> {
        let path = self.path_for(key);
        let rows = state
            .to_rows(primary)
            .into_iter()
            .map(|row| row.into_iter().map(|(_, v)| v).collect::<Vec<_>>());
        write_atomic(&path, &state.headers(), rows)?;
        log::info!(
            "[{key}] Saved {} record(s) to {}",
            state.records.len(),
            path.display()
        );
        Ok(path)
    }

    /// Writes a presence report next to the record sets.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the file cannot be written.
    pub fn persist_presence(&self, report: &PresenceReport) -> Result<PathBuf, SinkError> {
        let path = self.status_path_for(report.window);
        let headers = [
            CHANGE_COLUMN,
            NAME_COLUMN,
            ID_COLUMN,
            STATUS_COLUMN,
            COMMENT_COLUMN,
        ]
        .map(str::to_owned);
        let rows = report.entries.iter().map(|e| {
            vec![
                e.change.to_string(),
                e.display_name.clone(),
                e.resource_id.clone(),
                e.status.to_string(),
                e.comment.clone(),
            ]
        });
        write_atomic(&path, &headers, rows)?;
        Ok(path)
    }

    /// Keys of every window persisted in the output directory.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the directory exists but cannot be read.
    pub fn persisted_windows(&self) -> Result<BTreeSet<WindowKey>, SinkError> {
        let mut keys = BTreeSet::new();
        if !self.dir.exists() {
            return Ok(keys);
        }

        let lead = format!("{}_", self.prefix);
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(stem) = name.strip_prefix(&lead).and_then(|s| s.strip_suffix(".csv"))
                && let Some(key) = parse_file_stem(stem)
            {
                keys.insert(key);
            }
        }
        Ok(keys)
    }
}

/// `2025_01` or `2025_W03`.
fn file_stem(key: WindowKey) -> String {
    key.to_string().replacen('-', "_", 1)
}

fn parse_file_stem(stem: &str) -> Option<WindowKey> {
    stem.replacen('_', "-", 1).parse().ok()
}

fn write_atomic<I>(path: &Path, headers: &[String], rows: I) -> Result<(), SinkError>
where
    I: IntoIterator<Item = Vec<String>>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = write_tmp(&tmp, headers, rows)
        .and_then(|()| fs::rename(&tmp, path).map_err(SinkError::from));
    if result.is_err() {
        // Any previous file at `path` is left untouched.
        if let Err(e) = fs::remove_file(&tmp) {
            log::debug!("Could not remove {}: {e}", tmp.display());
        }
    }
    result
}

fn write_tmp<I>(tmp: &Path, headers: &[String], rows: I) -> Result<(), SinkError>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let file = File::create(tmp)?;
    {
        let mut writer = csv::Writer::from_writer(&file);
        writer.write_record(headers)?;
        for row in rows {
            writer.write_record(&row)?;
        }
        writer.flush()?;
    }
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{PresenceChange, PresenceEntry};

    fn jan() -> WindowKey {
        WindowKey::Month {
            year: 2025,
            month: 1,
        }
    }

    fn sample_state() -> SyncState {
        let mut state = SyncState::new(vec!["Reach".to_string(), "Publications".to_string()]);
        for (id, reach, publications, status) in [
            ("1", Some(10), Some(2), RecordStatus::Ok),
            ("2", Some(300), None, RecordStatus::Updated),
            ("3", Some(0), Some(0), RecordStatus::NoAccess),
        ] {
            let mut values = BTreeMap::new();
            if let Some(r) = reach {
                values.insert("Reach".to_string(), r);
            }
            if let Some(p) = publications {
                values.insert("Publications".to_string(), p);
            }
            state.records.insert(
                id.to_string(),
                ResultRecord {
                    resource_id: id.to_string(),
                    display_name: format!("Page, {id}"),
                    values,
                    status,
                    comment: if status == RecordStatus::NoAccess {
                        "Could not fetch Page Access Token".to_string()
                    } else {
                        String::new()
                    },
                },
            );
        }
        state
    }

    #[test]
    fn names_files_after_window_keys() {
        let sink = CsvSink::new("/out", "FB");
        assert_eq!(sink.path_for(jan()), PathBuf::from("/out/FB_2025_01.csv"));
        assert_eq!(
            sink.path_for(WindowKey::Week { year: 2025, week: 3 }),
            PathBuf::from("/out/FB_2025_W03.csv")
        );
        assert_eq!(
            sink.status_path_for(jan()),
            PathBuf::from("/out/FB_STATUS_2025_01.csv")
        );
    }

    #[test]
    fn persist_then_load_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path(), "FB");
        let state = sample_state();

        let path = sink.persist(jan(), &state, "Reach").unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("FB_2025_01.csv.tmp").exists());

        let loaded = sink.load(jan()).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.records["2"].value("Publications"), None);
    }

    #[test]
    fn failed_write_leaves_no_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path(), "FB");
        // A non-empty directory in place of the target makes the rename fail.
        let target = sink.path_for(jan());
        fs::create_dir_all(target.join("blocker")).unwrap();

        assert!(sink.persist(jan(), &sample_state(), "Reach").is_err());
        assert!(!dir.path().join("FB_2025_01.csv.tmp").exists());
        assert!(target.is_dir());
    }

    #[test]
    fn persisted_rows_are_sorted_by_primary_metric() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path(), "FB");
        let path = sink.persist(jan(), &sample_state(), "Reach").unwrap();

        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "Page,Page ID,Reach,Publications,Status,Comment");
        assert_eq!(lines[1], "\"Page, 2\",2,300,,UPDATED,");
        assert!(lines[2].starts_with("\"Page, 1\",1,10,2,OK"));
    }

    #[test]
    fn load_of_unknown_window_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path(), "FB");
        assert!(sink.load(jan()).unwrap().is_none());
    }

    #[test]
    fn load_treats_unreadable_cells_leniently() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path(), "FB");
        fs::write(
            sink.path_for(jan()),
            "Page,Page ID,Reach,Status,Comment\nA,1,n/a,SOMETHING,\n",
        )
        .unwrap();

        let state = sink.load(jan()).unwrap().unwrap();
        assert_eq!(state.columns, vec!["Reach"]);
        assert_eq!(state.records["1"].value("Reach"), None);
        assert_eq!(state.records["1"].status, RecordStatus::Unknown);
    }

    #[test]
    fn load_rejects_duplicates_and_missing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path(), "FB");

        fs::write(
            sink.path_for(jan()),
            "Page,Page ID,Reach,Status,Comment\nA,1,5,OK,\nA again,1,6,OK,\n",
        )
        .unwrap();
        assert!(matches!(
            sink.load(jan()),
            Err(SinkError::DuplicateResource { resource_id, .. }) if resource_id == "1"
        ));

        fs::write(sink.path_for(jan()), "Page,Reach\nA,5\n").unwrap();
        assert!(matches!(sink.load(jan()), Err(SinkError::Schema { .. })));
    }

    #[test]
    fn lists_persisted_windows_only() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path(), "FB");
        let state = sample_state();
        sink.persist(jan(), &state, "Reach").unwrap();
        sink.persist(WindowKey::Week { year: 2025, week: 6 }, &state, "Reach")
            .unwrap();
        fs::write(dir.path().join("FB_STATUS_2025_01.csv"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::write(dir.path().join("OTHER_2025_02.csv"), "").unwrap();

        let keys: Vec<_> = sink
            .persisted_windows()
            .unwrap()
            .into_iter()
            .map(|k| k.to_string())
            .collect();
        assert_eq!(keys, vec!["2025-01", "2025-W06"]);
    }

    #[test]
    fn writes_presence_report() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path(), "FB");
        let report = PresenceReport {
            window: jan(),
            previous: jan().previous_month(),
            entries: vec![PresenceEntry {
                resource_id: "9".to_string(),
                display_name: "Gone".to_string(),
                change: PresenceChange::Dropped,
                status: RecordStatus::Ok,
                comment: String::new(),
            }],
        };

        let path = sink.persist_presence(&report).unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert_eq!(
            text,
            "Change,Page,Page ID,Status,Comment\nDROPPED,Gone,9,OK,\n"
        );
    }
}
