//! Which windows still need syncing.
//!
//! Only fully elapsed periods are ever scheduled: the month containing
//! `today` is still in progress and is always excluded.

use std::collections::BTreeSet;

use chrono::{Datelike, Duration, NaiveDate};
use insight_sync_metrics_models::{FetchWindow, WindowKey};

/// Errors from window scheduling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// Schedules start at a month.
    #[error("Start period must be a month (YYYY-MM), got {key}")]
    NotAMonth {
        /// The rejected key.
        key: WindowKey,
    },
}

/// Every month from `start` up to, but not including, the month of `today`.
///
/// # Errors
///
/// Returns [`ScheduleError::NotAMonth`] if `start` is a week key.
pub fn elapsed_months(start: WindowKey, today: NaiveDate) -> Result<Vec<FetchWindow>, ScheduleError> {
    let WindowKey::Month { .. } = start else {
        return Err(ScheduleError::NotAMonth { key: start });
    };
    let current = WindowKey::Month {
        year: today.year(),
        month: today.month(),
    };

    let mut windows = Vec::new();
    let mut key = start;
    while key < current {
        if let Some(window) = FetchWindow::for_key(key) {
            windows.push(window);
        }
        key = key.next_month();
    }
    Ok(windows)
}

/// The elapsed months from `start` that are not in `existing`.
///
/// Pure: the same inputs always give the same list.
///
/// # Errors
///
/// Returns [`ScheduleError::NotAMonth`] if `start` is a week key.
pub fn missing_windows(
    start: WindowKey,
    existing: &BTreeSet<WindowKey>,
    today: NaiveDate,
) -> Result<Vec<FetchWindow>, ScheduleError> {
    Ok(elapsed_months(start, today)?
        .into_iter()
        .filter(|w| !existing.contains(&w.key))
        .collect())
}

/// The ISO weeks whose Monday falls in the given month.
#[must_use]
pub fn weeks_in_month(year: i32, month: u32) -> Vec<FetchWindow> {
    let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
        return Vec::new();
    };
    let offset = (7 - i64::from(first.weekday().num_days_from_monday())) % 7;
    let mut monday = first + Duration::days(offset);

    let mut weeks = Vec::new();
    while monday.month() == month {
        if let Some(window) = FetchWindow::week(monday) {
            weeks.push(window);
        }
        monday += Duration::days(7);
    }
    weeks
}

/// The fully elapsed weeks of every elapsed month from `start` that are
/// not in `existing`.
///
/// # Errors
///
/// Returns [`ScheduleError::NotAMonth`] if `start` is a week key.
pub fn missing_weeks(
    start: WindowKey,
    existing: &BTreeSet<WindowKey>,
    today: NaiveDate,
) -> Result<Vec<FetchWindow>, ScheduleError> {
    Ok(elapsed_months(start, today)?
        .iter()
        .flat_map(|m| weeks_in_month(m.since.year(), m.since.month()))
        .filter(|w| w.until <= today && !existing.contains(&w.key))
        .collect())
}
