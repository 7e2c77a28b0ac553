//! Page token resolution and master token validation.

use std::collections::HashMap;

use serde_json::Value;

use crate::{GraphEndpoints, Transport};

/// Resolves page-scoped tokens, caching successes for the run.
///
/// The cache is never persisted: tokens may rotate between runs.
#[derive(Debug, Clone, Default)]
pub struct TokenExchanger {
    endpoints: GraphEndpoints,
    cache: HashMap<String, String>,
}

impl TokenExchanger {
    /// Creates an exchanger with an empty cache.
    #[must_use]
    pub fn new(endpoints: GraphEndpoints) -> Self {
        Self {
            endpoints,
            cache: HashMap::new(),
        }
    }

    /// Returns the token for `resource_id`, or `None` if it cannot be
    /// resolved. Failures are logged and not cached.
    pub async fn resolve_token<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        resource_id: &str,
        master_token: &str,
    ) -> Option<String> {
        if let Some(token) = self.cache.get(resource_id) {
            return Some(token.clone());
        }

        let url = self.endpoints.node(resource_id);
        let query = [("fields", "access_token"), ("access_token", master_token)];

        let response = match transport.get(&url, &query).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Token request for {resource_id} failed: {e}");
                return None;
            }
        };

        if let Some(message) = response.failure_message() {
            log::warn!("No page token for {resource_id}: {message}");
            return None;
        }

        let Some(token) = response
            .body
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
        else {
            log::warn!("No page token for {resource_id}: access_token missing from response");
            return None;
        };

        self.cache.insert(resource_id.to_string(), token.to_string());
        Some(token.to_string())
    }

    /// Number of cached tokens.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

/// Why the master token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// The token introspection endpoint could not be reached.
    #[error("Could not validate access token: {message}")]
    Unreachable {
        /// Description of the failure.
        message: String,
    },

    /// The token is not valid.
    #[error("Access token is invalid: {message}")]
    Invalid {
        /// Description of the failure.
        message: String,
    },
}

/// Facts about a validated master token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    /// Application the token belongs to.
    pub app_id: Option<String>,
    /// Unix expiry timestamp, if the token expires.
    pub expires_at: Option<i64>,
}

/// Checks the master token against the introspection endpoint.
///
/// # Errors
///
/// Returns [`TokenError`] if the endpoint is unreachable or reports the
/// token as invalid.
pub async fn validate_master_token<T: Transport + ?Sized>(
    transport: &mut T,
    endpoints: &GraphEndpoints,
    master_token: &str,
) -> Result<TokenInfo, TokenError> {
    let query = [("input_token", master_token), ("access_token", master_token)];
    let response = transport
        .get(&endpoints.debug_token(), &query)
        .await
        .map_err(|e| TokenError::Unreachable {
            message: e.to_string(),
        })?;

    if let Some(message) = response.failure_message() {
        return Err(TokenError::Invalid { message });
    }

    let data = response.body.get("data").unwrap_or(&Value::Null);
    if data.get("is_valid").and_then(Value::as_bool) != Some(true) {
        let message = data
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("is_valid is false")
            .to_string();
        return Err(TokenError::Invalid { message });
    }

    let app_id = data.get("app_id").and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    let expires_at = data
        .get("expires_at")
        .and_then(Value::as_i64)
        .filter(|t| *t > 0);

    log::info!(
        "Access token valid (app {})",
        app_id.as_deref().unwrap_or("unknown")
    );

    Ok(TokenInfo { app_id, expires_at })
}
