#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Metric fetching for insight syncing.
//!
//! [`fetcher::MetricFetcher`] turns a list of
//! [`MetricSpec`](insight_sync_metrics_models::MetricSpec)s into one
//! classified [`ResultRecord`](insight_sync_metrics_models::ResultRecord)
//! per resource and window. The metric lists themselves live in embedded
//! TOML files exposed through [`registry`].

pub mod fetcher;
pub mod registry;

pub use fetcher::{FetchReport, MetricFetcher};
pub use registry::{MetricSet, all_metric_sets, metric_set};
