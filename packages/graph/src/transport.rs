//! Governed HTTP transport.
//!
//! [`governed_get`] is the retry loop: it asks the [`RateGovernor`] for
//! permission before each attempt, feeds it every response, and sleeps
//! whatever the governor decides. [`HttpTransport`] plugs a `reqwest`
//! client into that loop.
//!
//! Client errors (4xx other than rate limits) are never retried: their
//! body is decoded and returned so callers can read the structured error
//! code.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::governor::{Decision, GovernorConfig, RateGovernor, ResponseSignal, RetryReason};
use crate::{ApiError, ApiResponse, Transport, TransportError, TransportStats};

/// Maximum length of the response body preview included in logs.
const BODY_PREVIEW_LEN: usize = 300;

/// An undecoded HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status.
    pub status: u16,
    /// Headers with lowercase names.
    pub headers: BTreeMap<String, String>,
    /// Body text.
    pub text: String,
}

/// A request that produced no response at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkFailure {
    /// Description of the failure.
    pub message: String,
}

/// Runs one logical request through the governor, retrying up to
/// `max_attempts` times in total.
///
/// `send` is called once per attempt.
///
/// # Errors
///
/// Returns [`TransportError`] describing the last failure once every
/// attempt has been rate limited, hit a server error, failed at the
/// network level, or returned an undecodable success body.
pub async fn governed_get<F, Fut>(
    governor: &mut RateGovernor,
    max_attempts: u32,
    mut send: F,
) -> Result<ApiResponse, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RawResponse, NetworkFailure>>,
{
    let attempts = max_attempts.max(1);
    let mut last_error = TransportError::Network {
        message: "no attempt made".to_string(),
    };

    for attempt in 0..attempts {
        governor.before_request().await;

        let delay = match send().await {
            Err(failure) => {
                log::warn!(
                    "Request failed (attempt {}/{attempts}): {}",
                    attempt + 1,
                    failure.message
                );
                last_error = TransportError::Network {
                    message: failure.message,
                };
                governor.network_retry_delay(attempt)
            }
            Ok(raw) => {
                let body: Result<Value, _> = serde_json::from_str(&raw.text);
                let error_kind = body
                    .as_ref()
                    .ok()
                    .and_then(ApiError::from_body)
                    .map(|e| e.kind);
                let signal = ResponseSignal::from_parts(raw.status, &raw.headers, error_kind);

                match governor.on_response(Instant::now(), &signal, attempt) {
                    Decision::RetryAfter { delay, reason } => {
                        last_error = match reason {
                            RetryReason::RateLimited => TransportError::RateLimited {
                                attempts: attempt + 1,
                            },
                            RetryReason::ServerError => TransportError::Server {
                                status: raw.status,
                                attempts: attempt + 1,
                            },
                        };
                        delay
                    }
                    Decision::Proceed => match body {
                        Ok(body) => {
                            return Ok(ApiResponse {
                                status: raw.status,
                                headers: raw.headers,
                                body,
                            });
                        }
                        Err(e) if (200..300).contains(&raw.status) => {
                            log::warn!(
                                "JSON parse failed (attempt {}/{attempts}): {e}\n  \
                                 body preview: {}",
                                attempt + 1,
                                preview(&raw.text)
                            );
                            last_error = TransportError::Decode {
                                message: e.to_string(),
                            };
                            governor.network_retry_delay(attempt)
                        }
                        Err(_) => {
                            log::debug!(
                                "HTTP {} with non-JSON body: {}",
                                raw.status,
                                preview(&raw.text)
                            );
                            return Ok(ApiResponse {
                                status: raw.status,
                                headers: raw.headers,
                                body: Value::Null,
                            });
                        }
                    },
                }
            }
        };

        if attempt + 1 < attempts {
            log::debug!("Retry {}/{attempts} in {delay:?}", attempt + 2);
            tokio::time::sleep(delay).await;
        }
    }

    log::error!("Giving up after {attempts} attempts: {last_error}");
    Err(last_error)
}

fn preview(text: &str) -> &str {
    if text.len() <= BODY_PREVIEW_LEN {
        return text;
    }
    let mut end = BODY_PREVIEW_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// [`Transport`] backed by `reqwest`.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    governor: RateGovernor,
    max_attempts: u32,
}

impl HttpTransport {
    /// Creates a transport with a fixed per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Setup`] if the HTTP client cannot be
    /// built.
    pub fn new(config: GovernorConfig, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("insight-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Setup {
                message: e.to_string(),
            })?;
        let max_attempts = config.max_attempts;
        Ok(Self {
            client,
            governor: RateGovernor::new(config),
            max_attempts,
        })
    }

    /// The governor pacing this transport.
    #[must_use]
    pub const fn governor(&self) -> &RateGovernor {
        &self.governor
    }
}

async fn send_once(
    client: &reqwest::Client,
    url: &str,
    query: &[(&str, &str)],
) -> Result<RawResponse, NetworkFailure> {
    let response = client
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|e| NetworkFailure {
            message: describe(e),
        })?;

    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    let text = response.text().await.map_err(|e| NetworkFailure {
        message: describe(e),
    })?;

    Ok(RawResponse {
        status,
        headers,
        text,
    })
}

/// Describes a `reqwest` error without its URL, which carries tokens.
fn describe(e: reqwest::Error) -> String {
    let kind = if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection failed"
    } else if e.is_body() || e.is_decode() {
        "body read failed"
    } else {
        "request failed"
    };
    format!("{kind}: {}", e.without_url())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &mut self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<ApiResponse, TransportError> {
        let client = &self.client;
        governed_get(&mut self.governor, self.max_attempts, move || {
            send_once(client, url, query)
        })
        .await
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            calls: self.governor.calls(),
            backoff_multiplier: self.governor.state().backoff_multiplier,
            elapsed: self.governor.elapsed(),
        }
    }
}
