#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Windowed, incremental syncing of page insights into CSV record sets.
//!
//! A run is a list of [`FetchWindow`]s processed one after another. For
//! each window the [`SyncEngine`] loads what was already persisted,
//! fetches only what is missing (new pages, or columns added since the
//! window was written), merges the result, and persists the window once.

pub mod merge;
pub mod presence;
pub mod progress;
pub mod schedule;
pub mod sink;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use insight_sync_graph::discovery::{DEFAULT_PLACEHOLDER_PATTERN, DiscoveryError, ResourceDiscoverer};
use insight_sync_graph::token::{TokenError, TokenExchanger, TokenInfo, validate_master_token};
use insight_sync_graph::{GraphEndpoints, Transport, TransportStats};
use insight_sync_metrics::MetricFetcher;
use insight_sync_metrics::fetcher::DEFAULT_COMMENT_MAX_LEN;
use insight_sync_metrics_models::{
    COMMENT_COLUMN, FetchWindow, ID_COLUMN, MetricSpec, NAME_COLUMN, RecordStatus, Resource,
    ResultRecord, STATUS_COLUMN, SyncState, WindowKey,
};

use crate::merge::MergeError;
use crate::presence::{PresenceChange, PresenceReport};
use crate::progress::ProgressCallback;
use crate::schedule::ScheduleError;
use crate::sink::{CsvSink, SinkError};

/// Comment recorded for a page whose token could not be resolved.
pub const NO_TOKEN_COMMENT: &str = "Could not fetch Page Access Token";

/// Run-level failures. Anything narrower than a run is recorded in the
/// affected page's status instead.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Page listing failed.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// The master token was rejected.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// A window could not be loaded or persisted.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// A fetched batch could not be merged.
    #[error(transparent)]
    Merge(#[from] MergeError),

    /// The window schedule could not be built.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Invalid engine options.
    #[error("Invalid sync options: {message}")]
    Options {
        /// What is wrong.
        message: String,
    },
}

/// What a [`SyncEngine`] fetches and how it paces itself.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Metrics in output column order.
    pub metrics: Vec<MetricSpec>,
    /// Column record sets are sorted by. Defaults to the first metric.
    pub primary_metric: Option<String>,
    /// Discard persisted windows and fetch everything again.
    pub update_all: bool,
    /// Sleep between windows.
    pub window_pause: Duration,
    /// Sleep between pages within a window.
    pub resource_pause: Duration,
    /// Write a presence report after each month window.
    pub presence_report: bool,
    /// Page names matching this regex are never synced.
    pub placeholder_pattern: String,
    /// Maximum comment length, in characters.
    pub comment_max_len: usize,
}

impl SyncOptions {
    /// Options fetching `metrics` with every other setting at its default.
    #[must_use]
    pub fn new(metrics: Vec<MetricSpec>) -> Self {
        Self {
            metrics,
            primary_metric: None,
            update_all: false,
            window_pause: Duration::ZERO,
            resource_pause: Duration::ZERO,
            presence_report: true,
            placeholder_pattern: DEFAULT_PLACEHOLDER_PATTERN.to_string(),
            comment_max_len: DEFAULT_COMMENT_MAX_LEN,
        }
    }

    /// The output metric columns, in order.
    #[must_use]
    pub fn columns(&self) -> Vec<String> {
        self.metrics.iter().map(|m| m.column.clone()).collect()
    }

    /// The sort column.
    #[must_use]
    pub fn primary(&self) -> &str {
        self.primary_metric
            .as_deref()
            .or_else(|| self.metrics.first().map(|m| m.column.as_str()))
            .unwrap_or_default()
    }
}

/// Per-window outcome. Every discovered page is counted in exactly one of
/// `new`, `updated`, `skipped` or `failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSummary {
    /// Window this summary covers.
    pub key: WindowKey,
    /// Pages added to the window with a readable status.
    pub new: usize,
    /// Existing pages that had missing columns backfilled.
    pub updated: usize,
    /// Pages that needed nothing.
    pub skipped: usize,
    /// Pages that could not be read.
    pub failed: usize,
    /// Failed pages by status.
    pub failures: BTreeMap<RecordStatus, usize>,
    /// Whether the window file was (re)written.
    pub persisted: bool,
}

impl WindowSummary {
    const fn new(key: WindowKey) -> Self {
        Self {
            key,
            new: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            failures: BTreeMap::new(),
            persisted: false,
        }
    }

    fn fail(&mut self, status: RecordStatus) {
        self.failed += 1;
        *self.failures.entry(status).or_insert(0) += 1;
    }

    /// One-line description used for logs and progress bars.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut line = format!(
            "[{}] {} new, {} updated, {} skipped, {} failed",
            self.key, self.new, self.updated, self.skipped, self.failed
        );
        if !self.failures.is_empty() {
            let breakdown: Vec<_> = self
                .failures
                .iter()
                .map(|(status, n)| format!("{status}: {n}"))
                .collect();
            let _ = write!(line, " ({})", breakdown.join(", "));
        }
        line
    }
}

/// Outcome of [`SyncEngine::run_windows`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// One summary per window, in run order.
    pub windows: Vec<WindowSummary>,
    /// Transport counters at the end of the run.
    pub stats: TransportStats,
    /// Wall-clock time spent on the whole run.
    pub elapsed: Duration,
}

/// Drives windows through discovery, fetching, merging and persistence.
pub struct SyncEngine<T: Transport> {
    transport: T,
    endpoints: GraphEndpoints,
    discoverer: ResourceDiscoverer,
    tokens: TokenExchanger,
    fetcher: MetricFetcher,
    sink: CsvSink,
    master_token: String,
    options: SyncOptions,
    resources: Option<Vec<Resource>>,
}

impl<T: Transport> SyncEngine<T> {
    /// Creates an engine.
    ///
    /// # Errors
    ///
    /// * [`SyncError::Options`] if no metrics are configured
    /// * [`SyncError::Discovery`] if the placeholder pattern is invalid
    pub fn new(
        transport: T,
        endpoints: GraphEndpoints,
        master_token: impl Into<String>,
        sink: CsvSink,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        if options.metrics.is_empty() {
            return Err(SyncError::Options {
                message: "no metrics configured".to_string(),
            });
        }
        let columns = options.columns();
        let unique: BTreeSet<_> = columns.iter().collect();
        if unique.len() != columns.len() {
            return Err(SyncError::Options {
                message: "metric columns must be unique".to_string(),
            });
        }
        if let Some(reserved) = columns
            .iter()
            .find(|c| [NAME_COLUMN, ID_COLUMN, STATUS_COLUMN, COMMENT_COLUMN].contains(&c.as_str()))
        {
            return Err(SyncError::Options {
                message: format!("'{reserved}' is a reserved column name"),
            });
        }
        if !columns.iter().any(|c| c == options.primary()) {
            return Err(SyncError::Options {
                message: format!("primary metric '{}' is not a column", options.primary()),
            });
        }

        Ok(Self {
            discoverer: ResourceDiscoverer::new(endpoints.clone(), &options.placeholder_pattern)?,
            tokens: TokenExchanger::new(endpoints.clone()),
            fetcher: MetricFetcher::new(endpoints.clone(), options.comment_max_len),
            transport,
            endpoints,
            sink,
            master_token: master_token.into(),
            options,
            resources: None,
        })
    }

    /// The underlying transport.
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// The sink windows are persisted to.
    pub const fn sink(&self) -> &CsvSink {
        &self.sink
    }

    /// Checks the master token before any window is synced.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Token`] if the token is invalid or cannot be
    /// checked.
    pub async fn validate_master_token(&mut self) -> Result<TokenInfo, SyncError> {
        Ok(validate_master_token(&mut self.transport, &self.endpoints, &self.master_token).await?)
    }

    /// The pages reachable through the master token. Listed once per run.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Discovery`] if the first listing page fails.
    pub async fn discover(&mut self) -> Result<&[Resource], SyncError> {
        if self.resources.is_none() {
            let found = self
                .discoverer
                .list_resources(&mut self.transport, &self.master_token)
                .await?;
            for resource in &found {
                log::debug!("Discovered {} ({})", resource.display_name, resource.id);
            }
            self.resources = Some(found);
        }
        Ok(self.resources.as_deref().unwrap_or_default())
    }

    /// The windows a run starting at `start` should visit.
    ///
    /// Without `revisit`, these are the windows never persisted plus the
    /// persisted ones whose schema lacks a configured column or that hold
    /// a readable page with an empty column from a failed backfill. With
    /// `revisit` (or `update_all`), every elapsed window is included.
    ///
    /// # Errors
    ///
    /// * [`SyncError::Schedule`] if `start` is not a month
    /// * [`SyncError::Sink`] if the output directory cannot be read
    pub fn plan(
        &self,
        start: WindowKey,
        today: NaiveDate,
        weekly: bool,
        revisit: bool,
    ) -> Result<Vec<FetchWindow>, SyncError> {
        let persisted = if revisit || self.options.update_all {
            BTreeSet::new()
        } else {
            self.sink.persisted_windows()?
        };
        let mut windows = if weekly {
            schedule::missing_weeks(start, &persisted, today)?
        } else {
            schedule::missing_windows(start, &persisted, today)?
        };

        let requested = self.options.columns();
        for key in &persisted {
            if matches!(key, WindowKey::Week { .. }) != weekly
                || key.first_day() < start.first_day()
            {
                continue;
            }
            let Some(window) = FetchWindow::for_key(*key).filter(|w| w.until <= today) else {
                continue;
            };
            let Some(state) = self.sink.load(*key)? else {
                continue;
            };
            let missing = state.missing_columns(&requested);
            if !missing.is_empty() {
                log::info!(
                    "[{key}] Persisted without {}, scheduling backfill",
                    missing.join(", ")
                );
                windows.push(window);
                continue;
            }
            let incomplete = state
                .records
                .values()
                .filter(|r| r.status.is_ok() && !r.missing_columns(&requested).is_empty())
                .count();
            if incomplete > 0 {
                log::info!("[{key}] {incomplete} page(s) with empty columns, retrying backfill");
                windows.push(window);
            }
        }
        windows.sort_by_key(|w| w.key);
        Ok(windows)
    }

    /// Syncs one window and persists it.
    ///
    /// Pages already present in the persisted window are only fetched for
    /// the columns they lack. Pages missing from the current listing are
    /// kept.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] on run-level failures: discovery, merge
    /// integrity, or local storage.
    #[allow(clippy::too_many_lines)]
    pub async fn sync_window(
        &mut self,
        window: &FetchWindow,
        progress: &dyn ProgressCallback,
    ) -> Result<WindowSummary, SyncError> {
        let start = Instant::now();
        let key = window.key;
        let requested = self.options.columns();

        let existing = if self.options.update_all {
            log::info!("[{key}] Full refresh, ignoring persisted records");
            None
        } else {
            self.sink.load(key)?
        };
        let previous_columns = existing.as_ref().map(|s| s.columns.clone());

        let resources = self.discover().await?.to_vec();
        log::info!(
            "[{key}] Syncing {} to {} for {} page(s)",
            window.since,
            window.last_day(),
            resources.len()
        );
        progress.set_total(resources.len() as u64);

        let mut summary = WindowSummary::new(key);
        let mut fresh = Vec::new();

        for resource in &resources {
            progress.set_message(format!("[{key}] {}", resource.display_name));

            let specs: Vec<MetricSpec> =
                match existing.as_ref().and_then(|s| s.records.get(&resource.id)) {
                    Some(record) => {
                        let missing = record.missing_columns(&requested);
                        self.options
                            .metrics
                            .iter()
                            .filter(|m| missing.contains(&m.column))
                            .cloned()
                            .collect()
                    }
                    None => self.options.metrics.clone(),
                };
            if specs.is_empty() {
                summary.skipped += 1;
                progress.inc(1);
                continue;
            }

            if !fresh.is_empty() && !self.options.resource_pause.is_zero() {
                tokio::time::sleep(self.options.resource_pause).await;
            }

            let token = self
                .tokens
                .resolve_token(&mut self.transport, &resource.id, &self.master_token)
                .await;
            let record = match token {
                Some(token) => {
                    self.fetcher
                        .fetch_metrics(&mut self.transport, resource, &token, window, &specs)
                        .await
                        .record
                }
                None => {
                    log::warn!("[{key}] {}: {NO_TOKEN_COMMENT}", resource.display_name);
                    let columns: Vec<String> = specs.iter().map(|s| s.column.clone()).collect();
                    ResultRecord::no_access(
                        &resource.id,
                        &resource.display_name,
                        &columns,
                        NO_TOKEN_COMMENT,
                    )
                }
            };
            fresh.push(record);
            progress.inc(1);
        }

        let fetched: BTreeMap<String, RecordStatus> = fresh
            .iter()
            .map(|r| (r.resource_id.clone(), r.status))
            .collect();
        let had_file = existing.is_some();
        let outcome = merge::merge(existing.unwrap_or_default(), fresh, &requested)?;

        for id in &outcome.inserted {
            match fetched.get(id) {
                Some(status) if status.is_failure() => summary.fail(*status),
                _ => summary.new += 1,
            }
        }
        summary.updated = outcome.updated.len();
        for id in &outcome.backfill_failed {
            if let Some(status) = fetched.get(id) {
                summary.fail(*status);
            }
        }
        let accounted = outcome.inserted.len() + outcome.updated.len() + outcome.backfill_failed.len();
        summary.skipped += fetched.len().saturating_sub(accounted);

        let unchanged = had_file
            && outcome.inserted.is_empty()
            && outcome.updated.is_empty()
            && previous_columns.as_ref() == Some(&outcome.state.columns);

        if outcome.state.is_empty() {
            log::warn!("[{key}] No records to save");
        } else if unchanged {
            log::info!("[{key}] Nothing new, leaving {} untouched", self.sink.path_for(key).display());
        } else {
            self.sink
                .persist(key, &outcome.state, self.options.primary())?;
            summary.persisted = true;
        }

        if self.options.presence_report
            && matches!(key, WindowKey::Month { .. })
            && !outcome.state.is_empty()
        {
            presence_against_previous(&self.sink, key, &outcome.state)?;
        }

        let line = summary.describe();
        log::info!("{line}, took {:.1}s", start.elapsed().as_secs_f64());
        progress.finish(line);

        Ok(summary)
    }

    /// Syncs `windows` in order, pausing between them.
    ///
    /// `progress_for` supplies the progress reporter of each window.
    ///
    /// # Errors
    ///
    /// Stops at the first run-level failure and returns it.
    pub async fn run_windows<F>(
        &mut self,
        windows: &[FetchWindow],
        progress_for: F,
    ) -> Result<RunSummary, SyncError>
    where
        F: Fn(&FetchWindow) -> Arc<dyn ProgressCallback>,
    {
        let start = Instant::now();
        let mut summaries = Vec::with_capacity(windows.len());

        for (index, window) in windows.iter().enumerate() {
            if index > 0 && !self.options.window_pause.is_zero() {
                log::info!(
                    "Pausing {:.0}s before {}",
                    self.options.window_pause.as_secs_f64(),
                    window.key
                );
                tokio::time::sleep(self.options.window_pause).await;
            }
            let progress = progress_for(window);
            summaries.push(self.sync_window(window, progress.as_ref()).await?);
        }

        let stats = self.transport.stats();
        let elapsed = start.elapsed();
        log::info!(
            "Run complete: {} window(s), {} API call(s) ({:.0}/h), backoff multiplier {:.2}, took {:.1}s",
            summaries.len(),
            stats.calls,
            stats.calls_per_hour(),
            stats.backoff_multiplier,
            elapsed.as_secs_f64()
        );

        Ok(RunSummary {
            windows: summaries,
            stats,
            elapsed,
        })
    }
}

/// Regenerates the presence report of month `key` from persisted record
/// sets. Returns `None` if either month is missing.
///
/// # Errors
///
/// Returns [`SyncError::Sink`] if a record set cannot be read or the report
/// cannot be written.
pub fn write_presence_report(
    sink: &CsvSink,
    key: WindowKey,
) -> Result<Option<PresenceReport>, SyncError> {
    let Some(current) = sink.load(key)? else {
        log::warn!("[{key}] No record set at {}", sink.path_for(key).display());
        return Ok(None);
    };
    presence_against_previous(sink, key, &current)
}

fn presence_against_previous(
    sink: &CsvSink,
    key: WindowKey,
    current: &SyncState,
) -> Result<Option<PresenceReport>, SyncError> {
    let previous_key = key.previous_month();
    let Some(previous) = sink.load(previous_key)? else {
        log::debug!("[{key}] No {previous_key} record set, skipping presence report");
        return Ok(None);
    };

    let report = presence::compare(&previous, current, key, previous_key);
    let path = sink.persist_presence(&report)?;
    log::info!(
        "[{key}] Presence vs {previous_key}: {} new, {} dropped, {} flagged ({})",
        report.count(PresenceChange::New),
        report.count(PresenceChange::Dropped),
        report.count(PresenceChange::Flagged),
        path.display()
    );
    Ok(Some(report))
}
