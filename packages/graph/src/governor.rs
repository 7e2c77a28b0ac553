//! Adaptive request pacing.
//!
//! The [`RateGovernor`] keeps a backoff multiplier in
//! `[1.0, max_multiplier]`. Rate-limit signals (HTTP 429, rate-limit error
//! codes, or a usage header above the threshold) grow the multiplier and
//! arm a cooldown; every `decay_after_successes` consecutive successes
//! shrink it again. While the cooldown is armed, [`RateGovernor::before_request`]
//! blocks until `cooldown_base × multiplier` has passed since the last
//! signal.
//!
//! Server errors are retried with plain exponential backoff and never touch
//! the multiplier.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::GraphErrorKind;

/// Tuning knobs for the [`RateGovernor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Attempts per logical request, including the first.
    pub max_attempts: u32,
    /// Base delay for server-error and network retries.
    pub retry_base_delay_secs: f64,
    /// Cooldown after a rate-limit signal, scaled by the multiplier.
    pub cooldown_base_secs: f64,
    /// Upper bound for any single rate-limit sleep.
    pub max_sleep_secs: f64,
    /// Upper bound for a server-error retry delay.
    pub server_retry_cap_secs: f64,
    /// Usage percentage that counts as a rate-limit signal.
    pub usage_threshold_pct: f64,
    /// Consecutive successes before the multiplier decays.
    pub decay_after_successes: u32,
    /// Multiplier growth per rate-limit signal.
    pub growth_factor: f64,
    /// Multiplier decay per success streak.
    pub decay_factor: f64,
    /// Multiplier ceiling.
    pub max_multiplier: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay_secs: 5.0,
            cooldown_base_secs: 60.0,
            max_sleep_secs: 300.0,
            server_retry_cap_secs: 30.0,
            usage_threshold_pct: 80.0,
            decay_after_successes: 50,
            growth_factor: 1.5,
            decay_factor: 0.8,
            max_multiplier: 10.0,
        }
    }
}

/// Mutable pacing state. Lives for one process and is never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RateGovernorState {
    /// Current multiplier, starting at 1.0.
    pub backoff_multiplier: f64,
    /// Successes since the last signal or decay.
    pub consecutive_successes: u32,
    /// When the last rate-limit signal was seen.
    pub last_rate_limit: Option<Instant>,
}

impl Default for RateGovernorState {
    fn default() -> Self {
        Self {
            backoff_multiplier: 1.0,
            consecutive_successes: 0,
            last_rate_limit: None,
        }
    }
}

/// The parts of a response the governor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResponseSignal {
    /// HTTP status.
    pub status: u16,
    /// Parsed `Retry-After` header.
    pub retry_after: Option<Duration>,
    /// Highest percentage reported by the usage header.
    pub usage_pct: Option<f64>,
    /// Structured error kind from the body, if any.
    pub error_kind: Option<GraphErrorKind>,
}

impl ResponseSignal {
    /// Extracts the signal from a status, lowercase headers, and the
    /// classified body error.
    #[must_use]
    pub fn from_parts(
        status: u16,
        headers: &BTreeMap<String, String>,
        error_kind: Option<GraphErrorKind>,
    ) -> Self {
        Self {
            status,
            retry_after: headers
                .get("retry-after")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
            usage_pct: headers.get("x-app-usage").and_then(|v| parse_usage(v)),
            error_kind,
        }
    }
}

/// Parses an `X-App-Usage` header into its highest percentage.
#[must_use]
pub fn parse_usage(header: &str) -> Option<f64> {
    let value: Value = serde_json::from_str(header).ok()?;
    ["call_count", "total_time", "total_cputime"]
        .iter()
        .filter_map(|k| value.get(k).and_then(Value::as_f64))
        .reduce(f64::max)
}

/// Why a retry was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// Quota signal.
    RateLimited,
    /// HTTP 5xx.
    ServerError,
}

/// What the transport should do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Hand the response to the caller.
    Proceed,
    /// Sleep for `delay`, then send the request again.
    RetryAfter {
        /// How long to wait.
        delay: Duration,
        /// Why.
        reason: RetryReason,
    },
}

/// Paces and adapts request timing.
#[derive(Debug, Clone)]
pub struct RateGovernor {
    config: GovernorConfig,
    state: RateGovernorState,
    calls: u64,
    started: Instant,
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}

impl RateGovernor {
    /// Creates a governor with fresh state.
    #[must_use]
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            state: RateGovernorState::default(),
            calls: 0,
            started: Instant::now(),
        }
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// The current state.
    #[must_use]
    pub const fn state(&self) -> &RateGovernorState {
        &self.state
    }

    /// Requests issued so far, including retries.
    #[must_use]
    pub const fn calls(&self) -> u64 {
        self.calls
    }

    /// Time since the governor was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn cooldown(&self) -> Duration {
        secs(self.config.cooldown_base_secs * self.state.backoff_multiplier)
    }

    /// How long a request issued at `now` must still wait for the armed
    /// cooldown, if at all.
    #[must_use]
    pub fn pacing_delay(&self, now: Instant) -> Option<Duration> {
        let last = self.state.last_rate_limit?;
        let elapsed = now.saturating_duration_since(last);
        let cooldown = self.cooldown().min(secs(self.config.max_sleep_secs));
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }

    /// Blocks until the cooldown has passed, then counts the request.
    pub async fn before_request(&mut self) {
        if let Some(delay) = self.pacing_delay(Instant::now()) {
            log::info!(
                "Rate limit cooldown: waiting {:.0}s (multiplier {:.2})",
                delay.as_secs_f64(),
                self.state.backoff_multiplier
            );
            tokio::time::sleep(delay).await;
        }

        self.calls += 1;
        if self.calls % 100 == 0 {
            self.log_progress();
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn log_progress(&self) {
        let hours = self.elapsed().as_secs_f64() / 3600.0;
        let per_hour = if hours > 0.0 {
            self.calls as f64 / hours
        } else {
            0.0
        };
        log::info!(
            "API calls: {} ({per_hour:.0}/h), backoff multiplier {:.2}",
            self.calls,
            self.state.backoff_multiplier
        );
    }

    /// Records a rate-limit signal at `now`: grows the multiplier, resets
    /// the success streak, and arms the cooldown.
    pub fn register_rate_limit(&mut self, now: Instant) {
        self.state.last_rate_limit = Some(now);
        self.state.backoff_multiplier = (self.state.backoff_multiplier * self.config.growth_factor)
            .clamp(1.0, self.config.max_multiplier.max(1.0));
        self.state.consecutive_successes = 0;
    }

    /// Records a successful response, decaying the multiplier after a
    /// full success streak.
    pub fn record_success(&mut self) {
        self.state.consecutive_successes += 1;
        if self.state.consecutive_successes >= self.config.decay_after_successes.max(1) {
            let before = self.state.backoff_multiplier;
            self.state.backoff_multiplier = (before * self.config.decay_factor).max(1.0);
            self.state.consecutive_successes = 0;
            if self.state.backoff_multiplier < before {
                log::debug!(
                    "Backoff multiplier decayed {before:.2} -> {:.2}",
                    self.state.backoff_multiplier
                );
            }
        }
    }

    /// Updates state from a response received on zero-based `attempt`.
    pub fn on_response(&mut self, now: Instant, signal: &ResponseSignal, attempt: u32) -> Decision {
        let rate_limited = signal.status == 429
            || matches!(signal.error_kind, Some(GraphErrorKind::RateLimit));

        if rate_limited {
            self.register_rate_limit(now);
            let delay = signal
                .retry_after
                .unwrap_or_default()
                .max(self.cooldown())
                .min(secs(self.config.max_sleep_secs));
            log::warn!(
                "Rate limited (HTTP {}): multiplier {:.2}, waiting {:.0}s",
                signal.status,
                self.state.backoff_multiplier,
                delay.as_secs_f64()
            );
            return Decision::RetryAfter {
                delay,
                reason: RetryReason::RateLimited,
            };
        }

        if signal.status >= 500 {
            let delay = self.exponential_delay(attempt);
            log::warn!(
                "Server error (HTTP {}), retrying in {:.0}s",
                signal.status,
                delay.as_secs_f64()
            );
            return Decision::RetryAfter {
                delay,
                reason: RetryReason::ServerError,
            };
        }

        if (200..300).contains(&signal.status) {
            self.record_success();
            if let Some(usage) = signal.usage_pct
                && usage >= self.config.usage_threshold_pct
            {
                self.register_rate_limit(now);
                log::warn!(
                    "App usage at {usage:.0}%: multiplier {:.2}, pausing before next request",
                    self.state.backoff_multiplier
                );
            }
        }

        Decision::Proceed
    }

    /// Delay before retrying a network failure or undecodable body.
    #[must_use]
    pub fn network_retry_delay(&self, attempt: u32) -> Duration {
        self.exponential_delay(attempt)
    }

    fn exponential_delay(&self, attempt: u32) -> Duration {
        let factor = f64::from(2u32.saturating_pow(attempt.min(16)));
        secs((self.config.retry_base_delay_secs * factor).min(self.config.server_retry_cap_secs))
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(status: u16) -> ResponseSignal {
        ResponseSignal {
            status,
            ..ResponseSignal::default()
        }
    }

    #[test]
    fn multiplier_grows_monotonically_and_caps() {
        let mut governor = RateGovernor::default();
        let now = Instant::now();
        let mut previous = governor.state().backoff_multiplier;
        for attempt in 0..20 {
            governor.on_response(now, &signal(429), attempt);
            let current = governor.state().backoff_multiplier;
            assert!(current >= previous);
            assert!(current <= 10.0);
            previous = current;
        }
        assert!((previous - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn multiplier_decays_after_success_streak() {
        let mut governor = RateGovernor::default();
        let now = Instant::now();
        for attempt in 0..5 {
            governor.on_response(now, &signal(429), attempt);
        }
        let raised = governor.state().backoff_multiplier;

        for _ in 0..49 {
            governor.on_response(now, &signal(200), 0);
        }
        assert!((governor.state().backoff_multiplier - raised).abs() < f64::EPSILON);

        governor.on_response(now, &signal(200), 0);
        assert!(governor.state().backoff_multiplier < raised);
        assert_eq!(governor.state().consecutive_successes, 0);

        for _ in 0..50 * 20 {
            governor.on_response(now, &signal(200), 0);
        }
        assert!((governor.state().backoff_multiplier - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rate_limit_delay_honours_retry_after_and_cap() {
        let mut governor = RateGovernor::default();
        let now = Instant::now();
        let decision = governor.on_response(
            now,
            &ResponseSignal {
                status: 429,
                retry_after: Some(Duration::from_secs(120)),
                ..ResponseSignal::default()
            },
            0,
        );
        assert_eq!(
            decision,
            Decision::RetryAfter {
                delay: Duration::from_secs(120),
                reason: RetryReason::RateLimited
            }
        );

        let decision = governor.on_response(
            now,
            &ResponseSignal {
                status: 429,
                retry_after: Some(Duration::from_secs(3600)),
                ..ResponseSignal::default()
            },
            1,
        );
        assert_eq!(
            decision,
            Decision::RetryAfter {
                delay: Duration::from_secs(300),
                reason: RetryReason::RateLimited
            }
        );
    }

    #[test]
    fn rate_limit_error_code_counts_as_signal() {
        let mut governor = RateGovernor::default();
        let decision = governor.on_response(
            Instant::now(),
            &ResponseSignal {
                status: 400,
                error_kind: Some(GraphErrorKind::RateLimit),
                ..ResponseSignal::default()
            },
            0,
        );
        assert!(matches!(
            decision,
            Decision::RetryAfter {
                reason: RetryReason::RateLimited,
                ..
            }
        ));
        assert!((governor.state().backoff_multiplier - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn server_errors_back_off_without_touching_multiplier() {
        let mut governor = RateGovernor::default();
        let now = Instant::now();
        let delays: Vec<_> = (0..4)
            .map(|attempt| match governor.on_response(now, &signal(503), attempt) {
                Decision::RetryAfter { delay, .. } => delay.as_secs(),
                Decision::Proceed => 0,
            })
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 30]);
        assert!((governor.state().backoff_multiplier - 1.0).abs() < f64::EPSILON);
        assert!(governor.state().last_rate_limit.is_none());
    }

    #[test]
    fn high_usage_arms_cooldown_without_retry() {
        let mut governor = RateGovernor::default();
        let now = Instant::now();
        let decision = governor.on_response(
            now,
            &ResponseSignal {
                status: 200,
                usage_pct: Some(92.0),
                ..ResponseSignal::default()
            },
            0,
        );
        assert_eq!(decision, Decision::Proceed);
        assert_eq!(governor.pacing_delay(now), Some(Duration::from_secs(90)));
        assert_eq!(
            governor.pacing_delay(now + Duration::from_secs(60)),
            Some(Duration::from_secs(30))
        );
        assert_eq!(governor.pacing_delay(now + Duration::from_secs(90)), None);
    }

    #[test]
    fn parses_usage_header() {
        assert_eq!(
            parse_usage(r#"{"call_count":12,"total_time":85,"total_cputime":3}"#),
            Some(85.0)
        );
        assert_eq!(parse_usage("not json"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn before_request_waits_for_cooldown() {
        let mut governor = RateGovernor::default();
        let start = Instant::now();
        governor.register_rate_limit(start);
        governor.before_request().await;
        assert_eq!(start.elapsed(), Duration::from_secs(90));
        assert_eq!(governor.calls(), 1);
    }
}
