//! TOML configuration for the `insight_sync` binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use insight_sync_graph::discovery::DEFAULT_PLACEHOLDER_PATTERN;
use insight_sync_graph::governor::GovernorConfig;
use insight_sync_graph::{DEFAULT_API_VERSION, DEFAULT_BASE_URL, GraphEndpoints};
use insight_sync_ingest::SyncOptions;
use insight_sync_ingest::sink::CsvSink;
use insight_sync_metrics::fetcher::DEFAULT_COMMENT_MAX_LEN;
use insight_sync_metrics_models::{InvalidWindowKeyError, MetricSpec, WindowKey};
use serde::Deserialize;

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "insight_sync.toml";

/// Environment variable overriding `access_token`.
pub const TOKEN_ENV: &str = "INSIGHT_SYNC_ACCESS_TOKEN";

/// Remaining token lifetime, in days, below which a warning is logged.
const TOKEN_WARN_DAYS: i64 = 7;

/// Errors from loading or interpreting the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        /// File that could not be read.
        path: String,
        /// Underlying I/O failure.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`SyncConfig`].
    #[error("Failed to parse {path}: {message}")]
    Parse {
        /// File that failed to parse.
        path: String,
        /// Parser message, including the offending location.
        message: String,
    },

    /// No access token in the file or environment.
    #[error("No access token configured (set access_token or INSIGHT_SYNC_ACCESS_TOKEN)")]
    MissingToken,

    /// The access token is past its configured lifetime.
    #[error("Access token expired {days} day(s) ago, renew it and update token_last_updated")]
    TokenExpired {
        /// Days elapsed since the token's lifetime ended.
        days: i64,
    },

    /// `metric_set` names no embedded set.
    #[error("Unknown metric set '{id}' (available: {available})")]
    UnknownMetricSet {
        /// Requested set id.
        id: String,
        /// Comma-separated ids of the embedded sets.
        available: String,
    },

    /// `start_period` is malformed.
    #[error("Invalid start_period: {0}")]
    StartPeriod(#[from] InvalidWindowKeyError),
}

/// Contents of `insight_sync.toml`. Every key is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub access_token: Option<String>,
    /// Day the access token was issued.
    pub token_last_updated: Option<NaiveDate>,
    pub token_valid_days: i64,
    pub api_base_url: String,
    pub api_version: String,
    /// First month to sync, `YYYY-MM`.
    pub start_period: String,
    pub output_dir: PathBuf,
    pub file_prefix: String,
    /// Embedded metric set, used when `metrics` is empty.
    pub metric_set: Option<String>,
    /// Inline metric list, overriding `metric_set`.
    pub metrics: Vec<MetricSpec>,
    pub primary_metric: Option<String>,
    pub governor: GovernorConfig,
    pub request_timeout_secs: u64,
    pub window_pause_secs: u64,
    pub resource_pause_ms: u64,
    pub placeholder_pattern: String,
    pub comment_max_len: usize,
    pub presence_report: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            token_last_updated: None,
            token_valid_days: 60,
            api_base_url: DEFAULT_BASE_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            start_period: "2025-01".to_string(),
            output_dir: PathBuf::from("reports"),
            file_prefix: "FB".to_string(),
            metric_set: None,
            metrics: Vec::new(),
            primary_metric: None,
            governor: GovernorConfig::default(),
            request_timeout_secs: 30,
            window_pause_secs: 60,
            resource_pause_ms: 0,
            placeholder_pattern: DEFAULT_PLACEHOLDER_PATTERN.to_string(),
            comment_max_len: DEFAULT_COMMENT_MAX_LEN,
            presence_report: true,
        }
    }
}

impl SyncConfig {
    /// Reads the config at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text).map_err(|message| ConfigError::Parse {
            path: path.display().to_string(),
            message,
        })
    }

    /// Parses config TOML.
    ///
    /// # Errors
    ///
    /// Returns the parser message if the TOML is malformed.
    pub fn parse(text: &str) -> Result<Self, String> {
        toml::de::from_str(text).map_err(|e| e.to_string())
    }

    /// The access token, preferring `env_token` over the file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingToken`] if neither is set.
    pub fn access_token(&self, env_token: Option<String>) -> Result<String, ConfigError> {
        env_token
            .or_else(|| self.access_token.clone())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingToken)
    }

    /// Days the token has left on `today`, if its issue date is configured.
    /// Logs the token age and warns when it is close to expiring.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::TokenExpired`] once the lifetime has passed.
    pub fn check_token_age(&self, today: NaiveDate) -> Result<Option<i64>, ConfigError> {
        let Some(issued) = self.token_last_updated else {
            return Ok(None);
        };
        let age = (today - issued).num_days();
        let remaining = self.token_valid_days - age;
        log::info!("Access token is {age} day(s) old, {remaining} day(s) left");

        if remaining < 0 {
            return Err(ConfigError::TokenExpired { days: -remaining });
        }
        if remaining <= TOKEN_WARN_DAYS {
            log::warn!("Access token expires in {remaining} day(s), renew it soon");
        }
        Ok(Some(remaining))
    }

    /// The configured start month.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::StartPeriod`] if `start_period` is malformed.
    pub fn start_key(&self) -> Result<WindowKey, ConfigError> {
        Ok(self.start_period.parse()?)
    }

    /// The metrics to sync and the column to sort by.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownMetricSet`] if no inline metrics are
    /// given and `metric_set` names no embedded set.
    pub fn metrics(&self) -> Result<(Vec<MetricSpec>, Option<String>), ConfigError> {
        if !self.metrics.is_empty() {
            return Ok((self.metrics.clone(), self.primary_metric.clone()));
        }

        let id = self.metric_set.as_deref().unwrap_or("page_reach");
        let set = insight_sync_metrics::metric_set(id).ok_or_else(|| {
            ConfigError::UnknownMetricSet {
                id: id.to_string(),
                available: insight_sync_metrics::all_metric_sets()
                    .iter()
                    .map(|s| s.id.clone())
                    .collect::<Vec<_>>()
                    .join(", "),
            }
        })?;
        let primary = self
            .primary_metric
            .clone()
            .or_else(|| Some(set.primary().to_string()));
        Ok((set.metrics, primary))
    }

    /// Engine options for this config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the metric selection is invalid.
    pub fn sync_options(&self, update_all: bool) -> Result<SyncOptions, ConfigError> {
        let (metrics, primary_metric) = self.metrics()?;
        Ok(SyncOptions {
            primary_metric,
            update_all,
            window_pause: Duration::from_secs(self.window_pause_secs),
            resource_pause: Duration::from_millis(self.resource_pause_ms),
            presence_report: self.presence_report,
            placeholder_pattern: self.placeholder_pattern.clone(),
            comment_max_len: self.comment_max_len,
            ..SyncOptions::new(metrics)
        })
    }

    /// Endpoint builder for the configured host and API version.
    #[must_use]
    pub fn endpoints(&self) -> GraphEndpoints {
        GraphEndpoints::new(&self.api_base_url, &self.api_version)
    }

    /// Sink writing into the configured output directory.
    #[must_use]
    pub fn sink(&self) -> CsvSink {
        CsvSink::new(&self.output_dir, &self.file_prefix)
    }

    /// Per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use insight_sync_metrics_models::Period;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = SyncConfig::parse("").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.governor.max_attempts, 3);
        assert_eq!(config.start_key().unwrap(), WindowKey::Month { year: 2025, month: 1 });
    }

    #[test]
    fn parses_overrides_and_governor_section() {
        let config = SyncConfig::parse(
            r#"
            access_token = "abc"
            token_last_updated = "2025-03-01"
            start_period = "2024-11"
            output_dir = "out"
            window_pause_secs = 5

            [governor]
            max_attempts = 5
            cooldown_base_secs = 10.0
            "#,
        )
        .unwrap();

        assert_eq!(config.token_last_updated, Some(date(2025, 3, 1)));
        assert_eq!(config.output_dir, PathBuf::from("out"));
        assert_eq!(config.governor.max_attempts, 5);
        assert!((config.governor.cooldown_base_secs - 10.0).abs() < f64::EPSILON);
        assert!((config.governor.growth_factor - 1.5).abs() < f64::EPSILON);
        assert_eq!(
            config.start_key().unwrap(),
            WindowKey::Month { year: 2024, month: 11 }
        );
    }

    #[test]
    fn example_config_matches_defaults() {
        let config =
            SyncConfig::parse(include_str!("../../../insight_sync.example.toml")).unwrap();
        assert_eq!(
            config,
            SyncConfig {
                access_token: Some(String::new()),
                token_last_updated: Some(date(2025, 1, 15)),
                metric_set: Some("page_reach".to_string()),
                primary_metric: Some("Reach".to_string()),
                ..SyncConfig::default()
            }
        );
    }

    #[test]
    fn environment_token_wins() {
        let config = SyncConfig {
            access_token: Some("from-file".to_string()),
            ..SyncConfig::default()
        };
        assert_eq!(config.access_token(Some("from-env".to_string())).unwrap(), "from-env");
        assert_eq!(config.access_token(None).unwrap(), "from-file");
        assert!(matches!(
            SyncConfig::default().access_token(Some("  ".to_string())),
            Err(ConfigError::MissingToken)
        ));
    }

    #[test]
    fn token_age_warns_then_fails() {
        let config = SyncConfig {
            token_last_updated: Some(date(2025, 1, 1)),
            token_valid_days: 60,
            ..SyncConfig::default()
        };
        assert_eq!(config.check_token_age(date(2025, 1, 31)).unwrap(), Some(30));
        assert_eq!(config.check_token_age(date(2025, 2, 25)).unwrap(), Some(5));
        assert!(matches!(
            config.check_token_age(date(2025, 3, 5)),
            Err(ConfigError::TokenExpired { days: 3 })
        ));
        assert_eq!(SyncConfig::default().check_token_age(date(2025, 1, 1)).unwrap(), None);
    }

    #[test]
    fn defaults_to_embedded_page_reach_set() {
        let (metrics, primary) = SyncConfig::default().metrics().unwrap();
        assert_eq!(metrics[0].column, "Reach");
        assert_eq!(primary.as_deref(), Some("Reach"));
    }

    #[test]
    fn inline_metrics_override_metric_set() {
        let config = SyncConfig::parse(
            r#"
            metric_set = "page_reach_weekly"

            [[metrics]]
            column = "Views"
            metric = "page_views_total"
            periods = ["total_over_range"]
            "#,
        )
        .unwrap();
        let (metrics, primary) = config.metrics().unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].periods, vec![Period::TotalOverRange]);
        assert_eq!(primary, None);
    }

    #[test]
    fn unknown_metric_set_lists_alternatives() {
        let config = SyncConfig {
            metric_set: Some("nope".to_string()),
            ..SyncConfig::default()
        };
        let err = config.metrics().unwrap_err();
        assert!(err.to_string().contains("page_reach"));
    }

    #[test]
    fn options_carry_pauses() {
        let config = SyncConfig {
            window_pause_secs: 2,
            resource_pause_ms: 250,
            ..SyncConfig::default()
        };
        let options = config.sync_options(true).unwrap();
        assert!(options.update_all);
        assert_eq!(options.window_pause, Duration::from_secs(2));
        assert_eq!(options.resource_pause, Duration::from_millis(250));
        assert_eq!(options.primary(), "Reach");
    }
}
