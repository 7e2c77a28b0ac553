//! Per-resource metric fetching.
//!
//! Every [`MetricSpec`] is tried with its primary metric name first and
//! then each fallback. The outcome of a single request drives what
//! happens next:
//!
//! * unsupported metric: try the next name; after the last one the value
//!   is 0 and no error is recorded,
//! * permission denied or invalid token: the whole record becomes
//!   `NO_ACCESS` and no further requests are made for the resource,
//! * any other failure: the value is 0 and the message is accumulated
//!   into the record comment.
//!
//! Comment and conversation counts have no insights metric. They are
//! counted by walking newest-first listings through the same transport,
//! keeping the entries stamped inside the window.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};
use insight_sync_graph::{ApiResponse, GraphEndpoints, GraphErrorKind, Transport, TransportError};
use insight_sync_metrics_models::{
    AttemptOutcome, FetchAttempt, FetchWindow, MetricSource, MetricSpec, MetricValue, Period,
    RecordStatus, Resource, ResultRecord,
};
use serde_json::Value;

/// Default maximum length of a record comment, in characters.
pub const DEFAULT_COMMENT_MAX_LEN: usize = 250;

/// Number of error messages kept in an `API_ERROR` comment.
const MAX_COMMENT_ERRORS: usize = 3;

/// Page size requested from listing endpoints.
const LISTING_LIMIT: &str = "100";

/// Upper bound on listing pages read for one count.
const MAX_LISTING_PAGES: usize = 100;

/// Comment for records whose metrics were all zero.
pub const NO_DATA_COMMENT: &str = "All values are zero";

/// A fetched record plus the attempts that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    /// The classified record.
    pub record: ResultRecord,
    /// Every request made, in order.
    pub attempts: Vec<FetchAttempt>,
}

/// Fetches and classifies the metrics of one resource for one window.
#[derive(Debug, Clone)]
pub struct MetricFetcher {
    endpoints: GraphEndpoints,
    comment_max_len: usize,
}

impl MetricFetcher {
    /// Creates a fetcher truncating comments to `comment_max_len` characters.
    #[must_use]
    pub const fn new(endpoints: GraphEndpoints, comment_max_len: usize) -> Self {
        Self {
            endpoints,
            comment_max_len,
        }
    }

    /// Fetches every spec in `specs` for `resource` using its page `token`.
    ///
    /// Never fails: every problem is encoded in the returned record's
    /// status and comment.
    pub async fn fetch_metrics<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        resource: &Resource,
        token: &str,
        window: &FetchWindow,
        specs: &[MetricSpec],
    ) -> FetchReport {
        let label = window.key;
        let mut values = BTreeMap::new();
        let mut errors = Vec::new();
        let mut attempts = Vec::new();

        for spec in specs {
            let Some(period) = spec.period_for(window.granularity) else {
                log::debug!(
                    "[{label}] {} has no period usable for {} windows",
                    spec.column,
                    window.granularity
                );
                values.insert(spec.column.clone(), 0);
                continue;
            };

            let mut value = 0;
            for (index, name) in spec.candidates().enumerate() {
                let outcome = self
                    .fetch_one(transport, resource, token, window, spec.source, name, period)
                    .await;
                attempts.push(FetchAttempt {
                    metric: name.to_string(),
                    period,
                    outcome: outcome.clone(),
                });

                match outcome {
                    AttemptOutcome::Value(v) => {
                        log::debug!("[{label}] {} {}: {v}", resource.display_name, spec.column);
                        value = v;
                        break;
                    }
                    AttemptOutcome::Empty => {
                        log::debug!(
                            "[{label}] {} {}: no data points",
                            resource.display_name,
                            spec.column
                        );
                        break;
                    }
                    AttemptOutcome::Unsupported => {
                        let next = spec.fallbacks.get(index);
                        log::debug!(
                            "[{label}] Metric {name} unsupported for {}{}",
                            resource.display_name,
                            next.map_or_else(String::new, |n| format!(", trying {n}"))
                        );
                    }
                    AttemptOutcome::NoAccess { message } => {
                        log::warn!(
                            "[{label}] {}: access denied ({message})",
                            resource.display_name
                        );
                        for spec in specs {
                            values.entry(spec.column.clone()).or_insert(0);
                        }
                        let record = ResultRecord {
                            resource_id: resource.id.clone(),
                            display_name: resource.display_name.clone(),
                            values,
                            status: RecordStatus::NoAccess,
                            comment: truncate(&message, self.comment_max_len),
                        };
                        return FetchReport { record, attempts };
                    }
                    AttemptOutcome::Failed { message } => {
                        log::warn!(
                            "[{label}] {} {} failed: {message}",
                            resource.display_name,
                            spec.column
                        );
                        errors.push(format!("{}: {message}", spec.column));
                        break;
                    }
                }
            }
            values.insert(spec.column.clone(), value);
        }

        let (status, comment) = if specs.is_empty() {
            (RecordStatus::Unknown, "No metrics requested".to_string())
        } else if !errors.is_empty() {
            let joined = errors
                .iter()
                .take(MAX_COMMENT_ERRORS)
                .cloned()
                .collect::<Vec<_>>()
                .join("; ");
            (
                RecordStatus::ApiError,
                truncate(&joined, self.comment_max_len),
            )
        } else if values.values().all(|v| *v == 0) {
            (RecordStatus::NoData, NO_DATA_COMMENT.to_string())
        } else {
            (RecordStatus::Ok, String::new())
        };

        match status {
            RecordStatus::Ok => log::debug!("[{label}] {}: OK", resource.display_name),
            RecordStatus::ApiError => {
                log::warn!("[{label}] {}: {status} ({comment})", resource.display_name);
            }
            _ => log::info!("[{label}] {}: {status}", resource.display_name),
        }

        FetchReport {
            record: ResultRecord {
                resource_id: resource.id.clone(),
                display_name: resource.display_name.clone(),
                values,
                status,
                comment,
            },
            attempts,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_one<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        resource: &Resource,
        token: &str,
        window: &FetchWindow,
        source: MetricSource,
        metric: &str,
        period: Period,
    ) -> AttemptOutcome {
        match source {
            MetricSource::Insights => {
                let since = window.since.format("%Y-%m-%d").to_string();
                let until = window.until.format("%Y-%m-%d").to_string();
                let query = [
                    ("metric", metric),
                    ("period", period.as_ref()),
                    ("since", since.as_str()),
                    ("until", until.as_str()),
                    ("access_token", token),
                ];
                let response = transport
                    .get(&self.endpoints.insights(&resource.id), &query)
                    .await;
                match response_body(response) {
                    Ok(body) => outcome(extract_insight_value(&body, metric, period, window)),
                    Err(failure) => failure,
                }
            }
            MetricSource::PublishedPosts => {
                let since = unix_start(window.since).to_string();
                let until = (unix_start(window.until) - 1).to_string();
                let query = [
                    ("summary", "total_count"),
                    ("limit", "1"),
                    ("since", since.as_str()),
                    ("until", until.as_str()),
                    ("access_token", token),
                ];
                let response = transport
                    .get(&self.endpoints.published_posts(&resource.id), &query)
                    .await;
                match response_body(response) {
                    Ok(body) => outcome(
                        body.pointer("/summary/total_count")
                            .and_then(MetricValue::from_json),
                    ),
                    Err(failure) => failure,
                }
            }
            MetricSource::PostComments => {
                match self
                    .count_post_comments(transport, resource, token, window)
                    .await
                {
                    Ok(total) => AttemptOutcome::Value(total),
                    Err(failure) => failure,
                }
            }
            MetricSource::Conversations => {
                match self
                    .count_conversations(transport, resource, token, window)
                    .await
                {
                    Ok(total) => AttemptOutcome::Value(total),
                    Err(failure) => failure,
                }
            }
        }
    }

    /// Sums comments and replies over the posts created inside `window`.
    ///
    /// A post whose comments are unsupported (deleted or hidden) counts
    /// as zero. Any other failure fails the whole count.
    async fn count_post_comments<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        resource: &Resource,
        token: &str,
        window: &FetchWindow,
    ) -> Result<i64, AttemptOutcome> {
        let since = unix_start(window.since).to_string();
        let until = (unix_start(window.until) - 1).to_string();
        let query = [
            ("fields", "id,created_time"),
            ("limit", LISTING_LIMIT),
            ("since", since.as_str()),
            ("until", until.as_str()),
            ("access_token", token),
        ];
        let posts = entries_in_window(
            transport,
            &self.endpoints.posts(&resource.id),
            &query,
            "created_time",
            window,
        )
        .await?;

        let mut total: i64 = 0;
        for post in &posts {
            let Some(post_id) = post.get("id").and_then(Value::as_str) else {
                continue;
            };
            let query = [
                ("filter", "stream"),
                ("summary", "total_count"),
                ("limit", "0"),
                ("access_token", token),
            ];
            let response = transport
                .get(&self.endpoints.comments(post_id), &query)
                .await;
            let body = match response_body(response) {
                Ok(body) => body,
                Err(AttemptOutcome::Unsupported) => {
                    log::debug!("[{}] Comments of post {post_id} unavailable", window.key);
                    continue;
                }
                Err(outcome) => return Err(outcome),
            };
            let count = body
                .pointer("/summary/total_count")
                .and_then(MetricValue::from_json)
                .map_or(0, |v| v.total());
            total = total.saturating_add(count);
        }

        log::debug!(
            "[{}] {}: {total} comment(s) on {} post(s)",
            window.key,
            resource.display_name,
            posts.len()
        );
        Ok(total)
    }

    /// Counts conversations last updated inside `window`.
    async fn count_conversations<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        resource: &Resource,
        token: &str,
        window: &FetchWindow,
    ) -> Result<i64, AttemptOutcome> {
        let query = [
            ("fields", "id,updated_time"),
            ("limit", LISTING_LIMIT),
            ("access_token", token),
        ];
        let conversations = entries_in_window(
            transport,
            &self.endpoints.conversations(&resource.id),
            &query,
            "updated_time",
            window,
        )
        .await?;
        Ok(i64::try_from(conversations.len()).unwrap_or(i64::MAX))
    }
}

/// Walks a listing sorted by `time_field`, newest first, and returns the
/// entries stamped inside `window`.
///
/// `paging.next` is followed until it is absent, an entry older than the
/// window start is reached, or [`MAX_LISTING_PAGES`] pages were read.
/// Entries without a readable timestamp are skipped.
async fn entries_in_window<T: Transport + ?Sized>(
    transport: &mut T,
    url: &str,
    query: &[(&str, &str)],
    time_field: &str,
    window: &FetchWindow,
) -> Result<Vec<Value>, AttemptOutcome> {
    let since = unix_start(window.since);
    let until = unix_start(window.until);
    let mut entries = Vec::new();
    let mut body = response_body(transport.get(url, query).await)?;
    let mut pages = 1;

    loop {
        let mut reached_older = false;
        let page = body.get("data").and_then(Value::as_array).into_iter().flatten();
        for entry in page {
            let Some(time) = entry
                .get(time_field)
                .and_then(Value::as_str)
                .and_then(parse_timestamp)
            else {
                log::debug!("[{}] Ignoring entry without {time_field}: {entry}", window.key);
                continue;
            };
            if time < since {
                reached_older = true;
                break;
            }
            if time < until {
                entries.push(entry.clone());
            }
        }
        if reached_older {
            break;
        }

        let Some(next) = body
            .pointer("/paging/next")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            break;
        };
        if pages >= MAX_LISTING_PAGES {
            log::warn!(
                "[{}] Stopped after {pages} listing pages, count may be incomplete",
                window.key
            );
            break;
        }
        pages += 1;
        body = response_body(transport.get(&next, &[]).await)?;
    }

    Ok(entries)
}

/// The body of a usable response, or the outcome a failed one maps to.
fn response_body(response: Result<ApiResponse, TransportError>) -> Result<Value, AttemptOutcome> {
    let response = response.map_err(|e| AttemptOutcome::Failed {
        message: e.to_string(),
    })?;

    if let Some(error) = response.api_error() {
        return Err(match error.kind {
            GraphErrorKind::UnsupportedMetric => AttemptOutcome::Unsupported,
            kind if kind.is_resource_wide() => AttemptOutcome::NoAccess {
                message: error.to_string(),
            },
            _ => AttemptOutcome::Failed {
                message: error.to_string(),
            },
        });
    }
    if !response.is_success() {
        return Err(AttemptOutcome::Failed {
            message: format!("HTTP {}", response.status),
        });
    }
    Ok(response.body)
}

fn outcome(value: Option<MetricValue>) -> AttemptOutcome {
    value.map_or(AttemptOutcome::Empty, |v| AttemptOutcome::Value(v.total()))
}

/// Unix seconds of a Graph timestamp such as `2025-01-15T10:00:00+0000`.
fn parse_timestamp(text: &str) -> Option<i64> {
    DateTime::<FixedOffset>::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(text))
        .ok()
        .map(|t| t.timestamp())
}

fn unix_start(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// Reads the value of `metric` from an insights response body.
///
/// `day` values are summed across the window. For other periods the data
/// point ending on the window end is preferred, then the one ending on the
/// last day inside the window, then the last data point.
#[must_use]
pub fn extract_insight_value(
    body: &Value,
    metric: &str,
    period: Period,
    window: &FetchWindow,
) -> Option<MetricValue> {
    let entries = body.get("data")?.as_array()?;
    let entry = entries
        .iter()
        .find(|e| e.get("name").and_then(Value::as_str) == Some(metric))
        .or_else(|| entries.first())?;
    let points = entry.get("values")?.as_array()?;
    if points.is_empty() {
        return None;
    }

    if period == Period::Day {
        let totals: Vec<i64> = points
            .iter()
            .filter_map(|p| p.get("value").and_then(MetricValue::from_json))
            .map(|v| v.total())
            .collect();
        return (!totals.is_empty()).then(|| MetricValue::Scalar(totals.iter().sum()));
    }

    let point = point_ending_on(points, window.until)
        .or_else(|| point_ending_on(points, window.last_day()))
        .or_else(|| points.last())?;
    point.get("value").and_then(MetricValue::from_json)
}

fn point_ending_on(points: &[Value], date: NaiveDate) -> Option<&Value> {
    points.iter().find(|p| end_date(p) == Some(date))
}

fn end_date(point: &Value) -> Option<NaiveDate> {
    let end_time = point.get("end_time")?.as_str()?;
    NaiveDate::parse_from_str(end_time.get(..10)?, "%Y-%m-%d").ok()
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
