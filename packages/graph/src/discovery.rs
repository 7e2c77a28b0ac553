//! Paginated listing of managed pages.

use insight_sync_metrics_models::Resource;
use regex::Regex;
use serde_json::Value;

use crate::{GraphEndpoints, Transport};

/// Default pattern for generated placeholder page names.
pub const DEFAULT_PLACEHOLDER_PATTERN: &str = r"^Srholder\d+$";

/// Page size requested from the listing endpoint.
const PAGE_LIMIT: &str = "100";

/// Errors that abort discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The first page could not be fetched, so nothing is known.
    #[error("Failed to list pages: {message}")]
    FirstPage {
        /// Description of the failure.
        message: String,
    },

    /// The placeholder pattern is not a valid regex.
    #[error("Invalid placeholder pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Whether `name` is a generated placeholder that must never be synced.
#[must_use]
pub fn is_placeholder(name: &str, pattern: &Regex) -> bool {
    pattern.is_match(name.trim())
}

/// Lists the pages reachable through a master token.
#[derive(Debug, Clone)]
pub struct ResourceDiscoverer {
    endpoints: GraphEndpoints,
    placeholder: Regex,
}

impl ResourceDiscoverer {
    /// Creates a discoverer filtering names that match `placeholder_pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Pattern`] if the pattern does not compile.
    pub fn new(endpoints: GraphEndpoints, placeholder_pattern: &str) -> Result<Self, DiscoveryError> {
        Ok(Self {
            endpoints,
            placeholder: Regex::new(placeholder_pattern)?,
        })
    }

    /// Follows `paging.next` until it is absent and returns every
    /// non-placeholder page in discovery order.
    ///
    /// A failure on a later page stops pagination and keeps what was
    /// already fetched.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::FirstPage`] if the first page fails.
    pub async fn list_resources<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        master_token: &str,
    ) -> Result<Vec<Resource>, DiscoveryError> {
        let url = self.endpoints.accounts();
        let query = [
            ("fields", "id,name"),
            ("limit", PAGE_LIMIT),
            ("access_token", master_token),
        ];

        let first = match transport.get(&url, &query).await {
            Ok(response) => match response.failure_message() {
                None => response.body,
                Some(message) => return Err(DiscoveryError::FirstPage { message }),
            },
            Err(e) => {
                return Err(DiscoveryError::FirstPage {
                    message: e.to_string(),
                });
            }
        };

        let mut discovered = Vec::new();
        let mut next = collect_page(&first, &mut discovered);
        let mut page = 1;

        while let Some(next_url) = next.take() {
            page += 1;
            let body = match transport.get(&next_url, &[]).await {
                Ok(response) => match response.failure_message() {
                    None => response.body,
                    Some(message) => {
                        log::warn!("Stopping pagination at page {page}: {message}");
                        break;
                    }
                },
                Err(e) => {
                    log::warn!("Stopping pagination at page {page}: {e}");
                    break;
                }
            };
            next = collect_page(&body, &mut discovered).filter(|n| *n != next_url);
        }

        let (placeholders, resources): (Vec<_>, Vec<_>) = discovered
            .into_iter()
            .partition(|r| is_placeholder(&r.display_name, &self.placeholder));

        if !placeholders.is_empty() {
            let names: Vec<_> = placeholders.iter().map(|r| r.display_name.as_str()).collect();
            log::info!(
                "Skipping {} placeholder page(s): {}",
                placeholders.len(),
                names.join(", ")
            );
        }
        log::info!("Discovered {} page(s) across {page} listing page(s)", resources.len());

        Ok(resources)
    }
}

/// Appends the entries of one listing page and returns its `next` cursor.
fn collect_page(body: &Value, out: &mut Vec<Resource>) -> Option<String> {
    if let Some(entries) = body.get("data").and_then(Value::as_array) {
        for entry in entries {
            let Some(id) = entry.get("id").and_then(value_as_id) else {
                log::debug!("Ignoring listing entry without id: {entry}");
                continue;
            };
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .map_or_else(|| id.clone(), str::to_string);
            log::debug!("Discovered page {name} ({id})");
            out.push(Resource::new(id, name));
        }
    }

    body.pointer("/paging/next")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::TransportError;
    use crate::testing::ScriptedTransport;

    fn discoverer() -> ResourceDiscoverer {
        ResourceDiscoverer::new(GraphEndpoints::default(), DEFAULT_PLACEHOLDER_PATTERN).unwrap()
    }

    #[tokio::test]
    async fn follows_pagination_and_filters_placeholders() {
        let mut transport = ScriptedTransport::new()
            .on(
                "/me/accounts",
                &[("limit", "100")],
                200,
                json!({
                    "data": [{"id": "1", "name": "Alpha"}, {"id": "9", "name": "Srholder42"}],
                    "paging": {"next": "https://graph.test/page2?after=abc"}
                }),
            )
            .on(
                "/page2",
                &[("after", "abc")],
                200,
                json!({"data": [{"id": "2", "name": "Beta"}, {"id": "8", "name": "Srholder42"}]}),
            );

        let resources = discoverer()
            .list_resources(&mut transport, "master")
            .await
            .unwrap();

        assert_eq!(
            resources,
            vec![Resource::new("1", "Alpha"), Resource::new("2", "Beta")]
        );
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn first_page_failure_is_fatal() {
        let mut transport = ScriptedTransport::new().on(
            "/me/accounts",
            &[],
            400,
            json!({"error": {"code": 190, "message": "Invalid OAuth access token"}}),
        );
        let err = discoverer()
            .list_resources(&mut transport, "master")
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::FirstPage { .. }));
    }

    #[tokio::test]
    async fn later_page_failure_keeps_earlier_results() {
        let mut transport = ScriptedTransport::new()
            .on(
                "/me/accounts",
                &[],
                200,
                json!({
                    "data": [{"id": "1", "name": "Alpha"}],
                    "paging": {"next": "https://graph.test/page2"}
                }),
            )
            .on_error(
                "/page2",
                &[],
                TransportError::Network {
                    message: "timeout".to_string(),
                },
            );

        let resources = discoverer()
            .list_resources(&mut transport, "master")
            .await
            .unwrap();
        assert_eq!(resources, vec![Resource::new("1", "Alpha")]);
    }

    #[tokio::test]
    async fn repeated_cursor_stops_pagination() {
        let mut transport = ScriptedTransport::new().on(
            "/me/accounts",
            &[],
            200,
            json!({
                "data": [{"id": "1", "name": "Alpha"}],
                "paging": {"next": "https://graph.test/v19.0/me/accounts?after=x"}
            }),
        );
        let resources = discoverer()
            .list_resources(&mut transport, "master")
            .await
            .unwrap();
        assert_eq!(transport.requests().len(), 2);
        assert_eq!(resources.len(), 2);
    }

    #[test]
    fn placeholder_requires_numeric_suffix() {
        let pattern = Regex::new(DEFAULT_PLACEHOLDER_PATTERN).unwrap();
        assert!(is_placeholder("Srholder42", &pattern));
        assert!(is_placeholder("Srholder7", &pattern));
        assert!(!is_placeholder("Srholder", &pattern));
        assert!(!is_placeholder("Srholder4a", &pattern));
        assert!(!is_placeholder("Sveriges Radio P4", &pattern));
    }

    #[test]
    fn collect_page_skips_entries_without_id() {
        let body = serde_json::json!({
            "data": [
                {"id": "1", "name": "One"},
                {"name": "No id"},
                {"id": 2}
            ],
            "paging": {"next": "https://example.test/page2"}
        });
        let mut out = Vec::new();
        let next = collect_page(&body, &mut out);
        assert_eq!(next.as_deref(), Some("https://example.test/page2"));
        assert_eq!(out, vec![Resource::new("1", "One"), Resource::new("2", "2")]);
    }
}
