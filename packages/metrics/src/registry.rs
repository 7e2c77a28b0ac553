//! Metric set registry. Loads metric sets from embedded TOML configs.
//!
//! Each `.toml` file in `packages/metrics/sets/` is baked into the binary
//! at compile time via [`include_str!`].

use insight_sync_metrics_models::MetricSpec;
use serde::Deserialize;

/// A named, ordered list of metrics synced together.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetricSet {
    /// Identifier referenced from configuration.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Column results are sorted by. Defaults to the first metric.
    #[serde(default)]
    pub primary_metric: Option<String>,
    /// Metrics in output column order.
    pub metrics: Vec<MetricSpec>,
}

impl MetricSet {
    /// The output columns, in order.
    #[must_use]
    pub fn columns(&self) -> Vec<String> {
        self.metrics.iter().map(|m| m.column.clone()).collect()
    }

    /// The column results are sorted by.
    #[must_use]
    pub fn primary(&self) -> &str {
        self.primary_metric
            .as_deref()
            .or_else(|| self.metrics.first().map(|m| m.column.as_str()))
            .unwrap_or_default()
    }
}

/// Parses a metric set from TOML.
///
/// # Errors
///
/// Returns the parser message if the TOML is malformed or does not match
/// the [`MetricSet`] schema.
pub fn parse_metric_set_toml(toml_str: &str) -> Result<MetricSet, String> {
    toml::de::from_str(toml_str).map_err(|e| e.to_string())
}

/// TOML configs embedded at compile time.
const METRIC_SET_TOMLS: &[(&str, &str)] = &[
    ("page_reach", include_str!("../sets/page_reach.toml")),
    (
        "page_reach_weekly",
        include_str!("../sets/page_reach_weekly.toml"),
    ),
    (
        "page_interactions",
        include_str!("../sets/page_interactions.toml"),
    ),
];

#[cfg(test)]
const EXPECTED_SET_COUNT: usize = 3;

/// Returns all embedded metric sets.
///
/// # Panics
///
/// Panics if any embedded TOML config is malformed.
#[must_use]
pub fn all_metric_sets() -> Vec<MetricSet> {
    METRIC_SET_TOMLS
        .iter()
        .map(|(name, toml)| {
            parse_metric_set_toml(toml)
                .unwrap_or_else(|e| panic!("Failed to parse {name}.toml: {e}"))
        })
        .collect()
}

/// Looks up an embedded metric set by id.
#[must_use]
pub fn metric_set(id: &str) -> Option<MetricSet> {
    all_metric_sets().into_iter().find(|s| s.id == id)
}

#[cfg(test)]
mod tests {
    use insight_sync_metrics_models::{MetricSource, Period};

    use super::*;

    #[test]
    fn loads_all_metric_sets() {
        assert_eq!(all_metric_sets().len(), EXPECTED_SET_COUNT);
    }

    #[test]
    fn metric_set_ids_are_unique() {
        let sets = all_metric_sets();
        let mut ids: Vec<&str> = sets.iter().map(|s| s.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), EXPECTED_SET_COUNT);
    }

    #[test]
    fn all_metric_sets_have_required_fields() {
        for set in &all_metric_sets() {
            assert!(!set.name.is_empty(), "{}: name is empty", set.id);
            assert!(!set.metrics.is_empty(), "{}: no metrics", set.id);
            assert!(
                set.columns().iter().any(|c| c == set.primary()),
                "{}: primary metric is not a column",
                set.id
            );
            for spec in &set.metrics {
                assert!(!spec.periods.is_empty(), "{}: {} has no periods", set.id, spec.column);
            }
        }
    }

    #[test]
    fn page_reach_counts_publications_from_posts() {
        let set = metric_set("page_reach").unwrap();
        assert_eq!(
            set.columns(),
            vec!["Reach", "Engagements", "Reactions", "Publications"]
        );
        let publications = set.metrics.iter().find(|m| m.column == "Publications").unwrap();
        assert_eq!(publications.source, MetricSource::PublishedPosts);
        let reactions = set.metrics.iter().find(|m| m.column == "Reactions").unwrap();
        assert_eq!(reactions.fallbacks.len(), 1);
        assert_eq!(reactions.periods[0], Period::TotalOverRange);
    }

    #[test]
    fn page_interactions_counts_from_listings() {
        let set = metric_set("page_interactions").unwrap();
        assert_eq!(set.columns(), vec!["Comments", "Conversations"]);
        assert_eq!(set.primary(), "Comments");
        let sources: Vec<_> = set.metrics.iter().map(|m| m.source).collect();
        assert_eq!(
            sources,
            vec![MetricSource::PostComments, MetricSource::Conversations]
        );
    }

    #[test]
    fn rejects_unknown_period() {
        let err = parse_metric_set_toml(
            r#"
            id = "bad"
            name = "Bad"
            [[metrics]]
            column = "Reach"
            metric = "page_impressions_unique"
            periods = ["fortnight"]
            "#,
        );
        assert!(err.is_err());
    }
}
