use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::Period;

/// Endpoint a metric is read from.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MetricSource {
    /// The `/{id}/insights` endpoint.
    #[default]
    Insights,
    /// The `/{id}/published_posts` endpoint, counted via
    /// `summary.total_count`.
    PublishedPosts,
    /// Comments and replies on the posts created inside the window.
    ///
    /// Posts are listed from `/{id}/posts`, which returns them newest
    /// first, and each post's comments are counted through
    /// `/{post}/comments` with the `stream` filter so replies are included.
    PostComments,
    /// Conversations whose last activity falls inside the window.
    ///
    /// `/{id}/conversations` is ordered by `updated_time`, newest first,
    /// so listing stops at the first conversation older than the window.
    Conversations,
}


/// A named metric to fetch, mapped to an output column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Column name in the persisted result.
    pub column: String,
    /// Remote metric name.
    pub metric: String,
    /// Periods this metric is available at, in order of preference.
    pub periods: Vec<Period>,
    /// Alternate metric names tried when the primary one is unsupported.
    #[serde(default)]
    pub fallbacks: Vec<String>,
    /// Endpoint the metric is read from.
    #[serde(default)]
    pub source: MetricSource,
}

impl MetricSpec {
    /// Creates an insights metric with a single period and no fallbacks.
    #[must_use]
    pub fn insights(column: impl Into<String>, metric: impl Into<String>, period: Period) -> Self {
        Self {
            column: column.into(),
            metric: metric.into(),
            periods: vec![period],
            fallbacks: Vec::new(),
            source: MetricSource::Insights,
        }
    }

    /// Adds a fallback metric name.
    #[must_use]
    pub fn with_fallback(mut self, metric: impl Into<String>) -> Self {
        self.fallbacks.push(metric.into());
        self
    }

    /// The first declared period usable for a window synchronized at
    /// `granularity`.
    #[must_use]
    pub fn period_for(&self, granularity: Period) -> Option<Period> {
        self.periods
            .iter()
            .copied()
            .find(|p| p.applies_to(granularity))
    }

    /// The primary metric name followed by its fallbacks.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.metric.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }
}

/// A metric value as returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// A single number.
    Scalar(i64),
    /// Per-category counts, e.g. reactions by type.
    Breakdown(BTreeMap<String, i64>),
}

impl MetricValue {
    /// Interprets a JSON value as a metric value.
    ///
    /// Numbers and numeric strings become scalars. Objects become
    /// breakdowns, skipping entries that are not numeric. Anything else
    /// yields `None`.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self::Breakdown(
                map.iter()
                    .filter_map(|(k, v)| json_integer(v).map(|n| (k.clone(), n)))
                    .collect(),
            )),
            other => json_integer(other).map(Self::Scalar),
        }
    }

    /// The scalar value, or the sum of all breakdown entries. The sum
    /// saturates at the `i64` bounds.
    #[must_use]
    pub fn total(&self) -> i64 {
        match self {
            Self::Scalar(n) => *n,
            Self::Breakdown(map) => map.values().copied().fold(0, i64::saturating_add),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn json_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => {
            let s = s.trim();
            if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
                s.parse().ok()
            } else {
                None
            }
        }
        _ => None,
    }
}

/// How a single metric request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The metric returned a value.
    Value(i64),
    /// The metric was requested but returned no data points.
    Empty,
    /// The API rejected the metric name or period.
    Unsupported,
    /// The API denied access to the resource.
    NoAccess {
        /// Error message reported by the API.
        message: String,
    },
    /// Any other failure.
    Failed {
        /// Description of the failure.
        message: String,
    },
}

/// Audit entry for one metric request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchAttempt {
    /// Remote metric name that was requested.
    pub metric: String,
    /// Period it was requested at.
    pub period: Period,
    /// What happened.
    pub outcome: AttemptOutcome,
}
