//! HTTP upstream: one GET per call against a JSON API keyed by query parameter.
//!
//! The call kind selects the endpoint path, the task becomes the search
//! parameter and the credential token is passed as the key parameter. Static
//! query parameters and headers from config are added to every request. The
//! response body is returned as JSON without interpretation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use crate::classify::classify_status;
use crate::{CallRequest, CallResponse, ErrorClassification, Upstream, UpstreamError};

/// Header injection rule (name + value pair from config).
#[derive(Debug, Clone)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

/// Static query parameter added to every request.
#[derive(Debug, Clone)]
pub struct QueryParam {
    pub name: String,
    pub value: String,
}

/// Upstream reached over HTTP with the key in the query string.
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    paths: HashMap<String, String>,
    task_param: String,
    key_param: String,
    params: Vec<QueryParam>,
    headers: HeaderMap,
}

impl HttpUpstream {
    /// Build an HTTP upstream.
    ///
    /// Call kinds without an entry in `paths` use the kind itself as the path.
    /// Invalid header names or values are skipped with a warning.
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        paths: HashMap<String, String>,
        task_param: impl Into<String>,
        key_param: impl Into<String>,
        params: Vec<QueryParam>,
        headers: Vec<HeaderInjection>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            paths,
            task_param: task_param.into(),
            key_param: key_param.into(),
            params,
            headers: build_headers(&headers),
        }
    }

    /// Endpoint URL for a call kind, without query string.
    pub fn endpoint(&self, kind: &str) -> String {
        let path = self.paths.get(kind).map(String::as_str).unwrap_or(kind);
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn request_url(&self, request: &CallRequest<'_>) -> Result<reqwest::Url, UpstreamError> {
        let mut query: Vec<(&str, &str)> = self
            .params
            .iter()
            .map(|p| (p.name.as_str(), p.value.as_str()))
            .collect();
        query.push((self.task_param.as_str(), request.task));
        query.push((self.key_param.as_str(), request.token));

        reqwest::Url::parse_with_params(&self.endpoint(request.kind), &query)
            .map_err(|e| UpstreamError::permanent(format!("invalid request url: {e}")))
    }
}

fn build_headers(injections: &[HeaderInjection]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for injection in injections {
        let name = match HeaderName::from_str(&injection.name) {
            Ok(n) => n,
            Err(e) => {
                warn!(header = %injection.name, error = %e, "skipping invalid header name");
                continue;
            }
        };
        let value = match HeaderValue::from_str(&injection.value) {
            Ok(v) => v,
            Err(e) => {
                warn!(header = %injection.name, error = %e, "skipping invalid header value");
                continue;
            }
        };
        headers.insert(name, value);
    }
    headers
}

/// Map a transport failure (no response) to a classification.
fn classify_transport(error: &reqwest::Error) -> UpstreamError {
    if error.is_builder() {
        return UpstreamError::permanent(format!("building request: {error}"));
    }
    // Timeouts, refused connections and dropped bodies are all worth a retry.
    UpstreamError::transient(format!("request failed: {error}"))
}

impl Upstream for HttpUpstream {
    fn id(&self) -> &str {
        "http"
    }

    fn call<'a>(
        &'a self,
        request: CallRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = crate::Result<CallResponse>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.request_url(&request)?;
            debug!(kind = request.kind, task = request.task, "sending upstream request");

            let response = self
                .client
                .get(url)
                .headers(self.headers.clone())
                .send()
                .await
                .map_err(|e| classify_transport(&e))?;

            let status = response.status();
            let bytes = response
                .bytes()
                .await
                .map_err(|e| classify_transport(&e))?;

            if !status.is_success() {
                let body = String::from_utf8_lossy(&bytes);
                let classification = classify_status(status.as_u16(), &body);
                let message = truncate(&body, 512);
                return Err(UpstreamError {
                    classification,
                    status: Some(status.as_u16()),
                    message: format!("status {status}: {message}"),
                });
            }

            let body: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
                UpstreamError::new(
                    ErrorClassification::Transient,
                    format!("response body is not JSON: {e}"),
                )
                .with_status(status.as_u16())
            })?;

            Ok(CallResponse { body, cost: None })
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
