//! Time windows and aggregation periods.
//!
//! A [`FetchWindow`] is a half-open date interval `[since, until)` tagged
//! with the [`Period`] granularity it is synchronized at. Windows are
//! identified on disk by their [`WindowKey`] (`2025-01` for months,
//! `2025-W03` for ISO weeks).

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Aggregation period accepted by the insights endpoint.
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Period {
    /// One value per day; multi-day windows sum the daily values.
    Day,
    /// One value per ISO week.
    Week,
    /// A single value covering the lifetime of the resource.
    Lifetime,
    /// A single value covering exactly the requested range.
    TotalOverRange,
}

impl Period {
    /// Whether a metric reported at this period can describe a window
    /// synchronized at `window` granularity.
    #[must_use]
    pub const fn applies_to(self, window: Self) -> bool {
        match self {
            Self::Lifetime => true,
            Self::Day | Self::TotalOverRange => !matches!(window, Self::Lifetime),
            Self::Week => matches!(window, Self::Week),
        }
    }
}

/// Stable identifier of a persisted window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WindowKey {
    /// A calendar month.
    Month {
        /// Calendar year.
        year: i32,
        /// Month number, 1-12.
        month: u32,
    },
    /// An ISO week.
    Week {
        /// ISO week-numbering year.
        year: i32,
        /// ISO week number, 1-53.
        week: u32,
    },
}

impl WindowKey {
    /// Creates a month key, validating the month number.
    #[must_use]
    pub const fn month(year: i32, month: u32) -> Option<Self> {
        if month >= 1 && month <= 12 {
            Some(Self::Month { year, month })
        } else {
            None
        }
    }

    /// The month immediately before this one. Week keys map to the month
    /// preceding the month their Monday falls in.
    #[must_use]
    pub fn previous_month(self) -> Self {
        let (year, month) = match self {
            Self::Month { year, month } => (year, month),
            Self::Week { .. } => {
                let monday = self.first_day();
                (monday.year(), monday.month())
            }
        };
        if month == 1 {
            Self::Month {
                year: year - 1,
                month: 12,
            }
        } else {
            Self::Month {
                year,
                month: month - 1,
            }
        }
    }

    /// The month immediately after this month key.
    #[must_use]
    pub const fn next_month(self) -> Self {
        match self {
            Self::Month { year, month: 12 } => Self::Month {
                year: year + 1,
                month: 1,
            },
            Self::Month { year, month } => Self::Month {
                year,
                month: month + 1,
            },
            Self::Week { year, week } => Self::Week {
                year,
                week: week + 1,
            },
        }
    }

    /// The first calendar day covered by this key.
    #[must_use]
    pub fn first_day(self) -> NaiveDate {
        match self {
            Self::Month { year, month } => {
                NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
            }
            Self::Week { year, week } => {
                NaiveDate::from_isoywd_opt(year, week, Weekday::Mon).unwrap_or(NaiveDate::MIN)
            }
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Month { year, month } => write!(f, "{year:04}-{month:02}"),
            Self::Week { year, week } => write!(f, "{year:04}-W{week:02}"),
        }
    }
}

/// Error returned when a window key string is malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidWindowKeyError {
    /// The rejected input.
    pub input: String,
}

impl fmt::Display for InvalidWindowKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid period '{}': expected YYYY-MM or YYYY-Www",
            self.input
        )
    }
}

impl std::error::Error for InvalidWindowKeyError {}

impl FromStr for WindowKey {
    type Err = InvalidWindowKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidWindowKeyError {
            input: s.to_string(),
        };
        let (year, rest) = s.trim().split_once('-').ok_or_else(err)?;
        if year.len() != 4 {
            return Err(err());
        }
        let year: i32 = year.parse().map_err(|_| err())?;

        if let Some(week) = rest.strip_prefix('W') {
            let week: u32 = week.parse().map_err(|_| err())?;
            NaiveDate::from_isoywd_opt(year, week, Weekday::Mon).ok_or_else(err)?;
            return Ok(Self::Week { year, week });
        }

        if rest.len() != 2 {
            return Err(err());
        }
        let month: u32 = rest.parse().map_err(|_| err())?;
        Self::month(year, month).ok_or_else(err)
    }
}

/// A half-open date interval `[since, until)` plus the granularity it is
/// synchronized at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchWindow {
    /// Identifier used for persistence.
    pub key: WindowKey,
    /// First day included in the window.
    pub since: NaiveDate,
    /// First day after the window.
    pub until: NaiveDate,
    /// Granularity the window is synchronized at.
    pub granularity: Period,
}

impl FetchWindow {
    /// The window covering a whole calendar month, aggregated over the
    /// full range.
    #[must_use]
    pub fn month(year: i32, month: u32) -> Option<Self> {
        let key = WindowKey::month(year, month)?;
        let since = NaiveDate::from_ymd_opt(year, month, 1)?;
        let until = key.next_month().first_day();
        Some(Self {
            key,
            since,
            until,
            granularity: Period::TotalOverRange,
        })
    }

    /// The window covering the ISO week that starts on `monday`.
    ///
    /// Returns `None` if `monday` is not a Monday.
    #[must_use]
    pub fn week(monday: NaiveDate) -> Option<Self> {
        if monday.weekday() != Weekday::Mon {
            return None;
        }
        let iso = monday.iso_week();
        Some(Self {
            key: WindowKey::Week {
                year: iso.year(),
                week: iso.week(),
            },
            since: monday,
            until: monday + Duration::days(7),
            granularity: Period::Week,
        })
    }

    /// The window for `key` at its natural granularity.
    #[must_use]
    pub fn for_key(key: WindowKey) -> Option<Self> {
        match key {
            WindowKey::Month { year, month } => Self::month(year, month),
            WindowKey::Week { .. } => Self::week(key.first_day()),
        }
    }

    /// The last day included in the window.
    #[must_use]
    pub fn last_day(&self) -> NaiveDate {
        self.until.pred_opt().unwrap_or(self.since)
    }
}
