//! Scripted in-memory [`Transport`] for tests.
//!
//! Routes are matched in registration order by URL path suffix plus a
//! subset of query parameters. A matched route answers every time it is
//! hit. Unmatched requests get a 404 with a Graph-style error body.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::{ApiResponse, Transport, TransportError, TransportStats};

#[derive(Debug, Clone)]
enum Reply {
    Response(ApiResponse),
    Error(TransportError),
}

#[derive(Debug, Clone)]
struct Route {
    path_suffix: String,
    params: Vec<(String, String)>,
    reply: Reply,
}

/// A request received by a [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// URL without its query string.
    pub path: String,
    /// Query parameters from both the URL and the explicit query.
    pub query: Vec<(String, String)>,
}

impl RecordedRequest {
    /// The value of query parameter `name`, if present.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A [`Transport`] answering from a fixed script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    routes: Vec<Route>,
    requests: Vec<RecordedRequest>,
}

impl ScriptedTransport {
    /// An empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers requests whose path ends with `path_suffix` and whose query
    /// contains every pair in `params`.
    #[must_use]
    pub fn on(mut self, path_suffix: &str, params: &[(&str, &str)], status: u16, body: Value) -> Self {
        self.routes.push(Route {
            path_suffix: path_suffix.to_string(),
            params: owned(params),
            reply: Reply::Response(ApiResponse::new(status, body)),
        });
        self
    }

    /// Fails matching requests with `error`.
    #[must_use]
    pub fn on_error(mut self, path_suffix: &str, params: &[(&str, &str)], error: TransportError) -> Self {
        self.routes.push(Route {
            path_suffix: path_suffix.to_string(),
            params: owned(params),
            reply: Reply::Error(error),
        });
        self
    }

    /// Every request received so far.
    #[must_use]
    pub fn requests(&self) -> &[RecordedRequest] {
        &self.requests
    }

    /// Requests whose path ends with `path_suffix` and, if given, carry
    /// the query pair `param`.
    #[must_use]
    pub fn requests_matching(&self, path_suffix: &str, param: Option<(&str, &str)>) -> Vec<&RecordedRequest> {
        self.requests
            .iter()
            .filter(|r| r.path.ends_with(path_suffix))
            .filter(|r| param.is_none_or(|(k, v)| r.param(k) == Some(v)))
            .collect()
    }
}

fn owned(params: &[(&str, &str)]) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(
        &mut self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<ApiResponse, TransportError> {
        let (path, url_query) = url.split_once('?').unwrap_or((url, ""));
        let mut params: Vec<(String, String)> = url_query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        params.extend(owned(query));

        let request = RecordedRequest {
            path: path.to_string(),
            query: params,
        };

        let reply = self
            .routes
            .iter()
            .find(|route| {
                request.path.ends_with(&route.path_suffix)
                    && route
                        .params
                        .iter()
                        .all(|(k, v)| request.param(k) == Some(v.as_str()))
            })
            .map(|route| route.reply.clone());
        self.requests.push(request);

        match reply {
            Some(Reply::Response(response)) => Ok(response),
            Some(Reply::Error(error)) => Err(error),
            None => Ok(ApiResponse::new(
                404,
                json!({"error": {"code": 803, "message": "No scripted route"}}),
            )),
        }
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            calls: u64::try_from(self.requests.len()).unwrap_or(u64::MAX),
            backoff_multiplier: 1.0,
            ..TransportStats::default()
        }
    }
}
