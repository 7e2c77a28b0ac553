#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Scheduled page insight sync.
//!
//! Each run validates the access token, lists the pages it can reach, and
//! syncs every month (or ISO week with `--weekly`) that is not yet
//! persisted, backfilling columns added since earlier runs.

mod config;

use std::path::{Path, PathBuf};

use clap::Parser;
use insight_sync_cli_utils::{IndicatifProgress, MultiProgress};
use insight_sync_graph::transport::HttpTransport;
use insight_sync_ingest::{SyncEngine, schedule};
use insight_sync_metrics_models::{FetchWindow, WindowKey};

use crate::config::{DEFAULT_CONFIG_PATH, SyncConfig, TOKEN_ENV};

/// Exit status after Ctrl-C, matching a shell's SIGINT convention.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser)]
#[command(
    name = "insight_sync",
    about = "Sync page insights into one CSV record set per month"
)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Config file (default: `insight_sync.toml` if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// First month to sync, overriding `start_period` (YYYY-MM)
    #[arg(long)]
    start: Option<WindowKey>,

    /// Sync only this month (YYYY-MM)
    #[arg(long, conflicts_with = "status")]
    month: Option<WindowKey>,

    /// Sync ISO weeks instead of whole months
    #[arg(long)]
    weekly: bool,

    /// Refetch every window from scratch, ignoring persisted values
    #[arg(long, conflicts_with = "check_new")]
    update_all: bool,

    /// Revisit persisted windows to add new pages and missing columns
    #[arg(long)]
    check_new: bool,

    /// Only regenerate the presence report of this month (YYYY-MM)
    #[arg(long, conflicts_with_all = ["start", "weekly", "update_all", "check_new"])]
    status: Option<WindowKey>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let multi = insight_sync_cli_utils::init_logger(cli.debug);

    let config = load_config(cli.config.as_deref())?;

    tokio::select! {
        result = run(&cli, &config, &multi) => result,
        _ = tokio::signal::ctrl_c() => {
            log::warn!("Interrupted, windows already written are kept");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    }
}

/// Loads `path`, or the default config file if it exists.
fn load_config(path: Option<&Path>) -> Result<SyncConfig, config::ConfigError> {
    if let Some(path) = path {
        log::debug!("Loading config from {}", path.display());
        return SyncConfig::load(path);
    }

    let default_path = Path::new(DEFAULT_CONFIG_PATH);
    if default_path.exists() {
        log::debug!("Loading config from {DEFAULT_CONFIG_PATH}");
        SyncConfig::load(default_path)
    } else {
        log::info!("No {DEFAULT_CONFIG_PATH} found, using defaults");
        Ok(SyncConfig::default())
    }
}

async fn run(
    cli: &Cli,
    config: &SyncConfig,
    multi: &MultiProgress,
) -> Result<(), Box<dyn std::error::Error>> {
    let today = chrono::Local::now().date_naive();

    if let Some(key) = cli.status {
        require_month(key)?;
        if insight_sync_ingest::write_presence_report(&config.sink(), key)?.is_none() {
            log::warn!("[{key}] No presence report written");
        }
        return Ok(());
    }

    config.check_token_age(today)?;
    let token = config.access_token(std::env::var(TOKEN_ENV).ok())?;

    let transport = HttpTransport::new(config.governor.clone(), config.request_timeout())?;
    let mut engine = SyncEngine::new(
        transport,
        config.endpoints(),
        token,
        config.sink(),
        config.sync_options(cli.update_all)?,
    )?;
    engine.validate_master_token().await?;

    let windows = if let Some(key) = cli.month {
        month_windows(key, cli.weekly, today)?
    } else {
        let start = match cli.start {
            Some(key) => key,
            None => config.start_key()?,
        };
        engine.plan(start, today, cli.weekly, cli.check_new)?
    };

    if windows.is_empty() {
        log::info!("All windows are up to date");
        return Ok(());
    }
    log::info!(
        "Syncing {} window(s): {}",
        windows.len(),
        windows
            .iter()
            .map(|w| w.key.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let summary = engine
        .run_windows(&windows, |w| {
            IndicatifProgress::window_bar(multi, &format!("[{}]", w.key))
        })
        .await?;

    for window in &summary.windows {
        println!("{}", window.describe());
    }

    Ok(())
}

/// The windows of one explicitly requested month.
fn month_windows(
    key: WindowKey,
    weekly: bool,
    today: chrono::NaiveDate,
) -> Result<Vec<FetchWindow>, Box<dyn std::error::Error>> {
    let (year, month) = require_month(key)?;

    if weekly {
        let weeks: Vec<_> = schedule::weeks_in_month(year, month)
            .into_iter()
            .filter(|w| w.until <= today)
            .collect();
        if weeks.is_empty() {
            log::warn!("[{key}] No finished weeks yet");
        }
        return Ok(weeks);
    }

    let window = FetchWindow::for_key(key).ok_or_else(|| format!("Invalid month {key}"))?;
    if window.until > today {
        log::warn!("[{key}] Month is not over yet, values will be partial");
    }
    Ok(vec![window])
}

fn require_month(key: WindowKey) -> Result<(i32, u32), String> {
    match key {
        WindowKey::Month { year, month } => Ok((year, month)),
        WindowKey::Week { .. } => Err(format!("Expected a month (YYYY-MM), got {key}")),
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::try_parse_from([
            "insight_sync",
            "--start",
            "2024-11",
            "--weekly",
            "--check-new",
        ])
        .unwrap();
        assert_eq!(
            cli.start,
            Some(WindowKey::Month {
                year: 2024,
                month: 11
            })
        );
        assert!(cli.weekly);
        assert!(cli.check_new);
        assert!(!cli.update_all);
    }

    #[test]
    fn update_all_conflicts_with_check_new() {
        assert!(Cli::try_parse_from(["insight_sync", "--update-all", "--check-new"]).is_err());
    }

    #[test]
    fn status_conflicts_with_month() {
        assert!(
            Cli::try_parse_from(["insight_sync", "--status", "2025-02", "--month", "2025-01"])
                .is_err()
        );
    }

    #[test]
    fn rejects_malformed_month() {
        assert!(Cli::try_parse_from(["insight_sync", "--month", "2025-13"]).is_err());
    }

    #[test]
    fn explicit_month_is_one_window() {
        let key = WindowKey::Month {
            year: 2025,
            month: 1,
        };
        let windows = month_windows(key, false, date(2025, 3, 1)).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].since, date(2025, 1, 1));
        assert_eq!(windows[0].until, date(2025, 2, 1));
    }

    #[test]
    fn explicit_weekly_month_keeps_finished_weeks() {
        let key = WindowKey::Month {
            year: 2025,
            month: 1,
        };
        // Mondays in January 2025: 6, 13, 20, 27.
        let windows = month_windows(key, true, date(2025, 1, 27)).unwrap();
        let mondays: Vec<_> = windows.iter().map(|w| w.since).collect();
        assert_eq!(
            mondays,
            vec![date(2025, 1, 6), date(2025, 1, 13), date(2025, 1, 20)]
        );
    }

    #[test]
    fn week_keys_are_not_months() {
        let key = WindowKey::Week {
            year: 2025,
            week: 3,
        };
        assert!(require_month(key).is_err());
    }
}
