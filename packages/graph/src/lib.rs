#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Graph API access for insight syncing.
//!
//! Every outbound call goes through a [`Transport`]. The production
//! implementation, [`transport::HttpTransport`], gates each request on a
//! [`governor::RateGovernor`] that paces calls and adapts its backoff to
//! rate-limit signals. On top of the transport sit the
//! [`discovery::ResourceDiscoverer`] (paginated page listing) and the
//! [`token::TokenExchanger`] (per-page token resolution).

pub mod discovery;
pub mod error_code;
pub mod governor;
pub mod token;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

pub use error_code::GraphErrorKind;

/// Errors surfaced by a [`Transport`] once its retry budget is spent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection failure or timeout.
    #[error("Network error: {message}")]
    Network {
        /// Description of the failure.
        message: String,
    },

    /// Every attempt was rate limited.
    #[error("Rate limited after {attempts} attempts")]
    RateLimited {
        /// Number of attempts made.
        attempts: u32,
    },

    /// Every attempt failed with a server error.
    #[error("Server error (HTTP {status}) after {attempts} attempts")]
    Server {
        /// Last HTTP status received.
        status: u16,
        /// Number of attempts made.
        attempts: u32,
    },

    /// A successful response could not be decoded as JSON.
    #[error("Undecodable response: {message}")]
    Decode {
        /// Description of the failure.
        message: String,
    },

    /// The HTTP client could not be constructed.
    #[error("HTTP client setup failed: {message}")]
    Setup {
        /// Description of the failure.
        message: String,
    },
}

/// A structured `{error: {code, message}}` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// Integer error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Classification of `code`.
    pub kind: GraphErrorKind,
}

impl ApiError {
    /// Parses the `error` object of a response body, if present.
    #[must_use]
    pub fn from_body(body: &Value) -> Option<Self> {
        let error = body.get("error")?;
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        Some(Self {
            code,
            message,
            kind: GraphErrorKind::from_code(code),
        })
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// A decoded response. Error statuses keep their body so callers can
/// inspect structured error codes.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers with lowercase names.
    pub headers: BTreeMap<String, String>,
    /// Decoded JSON body, or `Null` for an undecodable error body.
    pub body: Value,
}

impl ApiResponse {
    /// A response with no headers.
    #[must_use]
    pub const fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body,
        }
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// The structured API error carried by the body, if any.
    #[must_use]
    pub fn api_error(&self) -> Option<ApiError> {
        ApiError::from_body(&self.body)
    }

    /// A one-line description of why this response is not usable, or
    /// `None` if it is a successful response without an error body.
    #[must_use]
    pub fn failure_message(&self) -> Option<String> {
        if let Some(error) = self.api_error() {
            return Some(error.to_string());
        }
        if self.is_success() {
            None
        } else {
            Some(format!("HTTP {}", self.status))
        }
    }
}

/// Counters exposed by a transport for run summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportStats {
    /// Requests issued, including retries.
    pub calls: u64,
    /// Current backoff multiplier.
    pub backoff_multiplier: f64,
    /// Time since the transport was created.
    pub elapsed: Duration,
}

impl TransportStats {
    /// Calls per hour over the elapsed time.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn calls_per_hour(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.calls as f64 * 3600.0 / secs
        }
    }
}

/// Issues one logical GET request.
///
/// Implementations own their retry policy: an `Err` means the request
/// could not be completed at all, while an `Ok` may still carry an error
/// status and structured error body.
#[async_trait]
pub trait Transport: Send {
    /// Sends a GET request to `url` with `query` appended.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] once retries are exhausted.
    async fn get(&mut self, url: &str, query: &[(&str, &str)])
    -> Result<ApiResponse, TransportError>;

    /// Request counters.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Default Graph API host.
pub const DEFAULT_BASE_URL: &str = "https://graph.facebook.com";
/// Default Graph API version.
pub const DEFAULT_API_VERSION: &str = "v19.0";

/// Builds versioned endpoint URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEndpoints {
    base_url: String,
    version: String,
}

impl Default for GraphEndpoints {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL, DEFAULT_API_VERSION)
    }
}

impl GraphEndpoints {
    /// Creates endpoints rooted at `base_url` for API `version`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            version: version.into().trim_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{path}", self.base_url, self.version)
    }

    /// Pages managed by the token owner.
    #[must_use]
    pub fn accounts(&self) -> String {
        self.url("me/accounts")
    }

    /// A single node.
    #[must_use]
    pub fn node(&self, id: &str) -> String {
        self.url(id)
    }

    /// Insights of a node.
    #[must_use]
    pub fn insights(&self, id: &str) -> String {
        self.url(&format!("{id}/insights"))
    }

    /// Published posts of a page.
    #[must_use]
    pub fn published_posts(&self, id: &str) -> String {
        self.url(&format!("{id}/published_posts"))
    }

    /// Posts of a page, newest first.
    #[must_use]
    pub fn posts(&self, id: &str) -> String {
        self.url(&format!("{id}/posts"))
    }

    /// Comments on a post or comment.
    #[must_use]
    pub fn comments(&self, id: &str) -> String {
        self.url(&format!("{id}/comments"))
    }

    /// Message threads of a page, most recently updated first.
    #[must_use]
    pub fn conversations(&self, id: &str) -> String {
        self.url(&format!("{id}/conversations"))
    }

    /// Token introspection.
    #[must_use]
    pub fn debug_token(&self) -> String {
        self.url("debug_token")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn endpoints_are_versioned() {
        let endpoints = GraphEndpoints::new("http://localhost:9000/", "v19.0");
        assert_eq!(endpoints.accounts(), "http://localhost:9000/v19.0/me/accounts");
        assert_eq!(endpoints.insights("42"), "http://localhost:9000/v19.0/42/insights");
        assert_eq!(
            endpoints.conversations("42"),
            "http://localhost:9000/v19.0/42/conversations"
        );
    }

    #[test]
    fn failure_message_prefers_structured_error() {
        let response = ApiResponse::new(
            400,
            json!({"error": {"code": 100, "message": "Invalid metric"}}),
        );
        assert_eq!(
            response.failure_message().as_deref(),
            Some("Invalid metric (code 100)")
        );
        assert_eq!(response.api_error().unwrap().kind, GraphErrorKind::UnsupportedMetric);

        assert_eq!(
            ApiResponse::new(404, Value::Null).failure_message().as_deref(),
            Some("HTTP 404")
        );
        assert!(ApiResponse::new(200, json!({"data": []})).failure_message().is_none());
    }

    #[test]
    fn calls_per_hour_handles_zero_elapsed() {
        let stats = TransportStats {
            calls: 10,
            backoff_multiplier: 1.0,
            elapsed: Duration::from_secs(1800),
        };
        assert!((stats.calls_per_hour() - 20.0).abs() < f64::EPSILON);
        assert!(TransportStats::default().calls_per_hour().abs() < f64::EPSILON);
    }
}
