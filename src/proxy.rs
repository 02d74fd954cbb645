//! Upstream forwarding for proxy-mode definitions.
//!
//! The mode is an upstream URL whose path may use the same `{name}`
//! placeholders as routes. One attempt is made with a fixed timeout; there is
//! no retry.

use crate::error::{MockError, MockResult};
use crate::matcher::{PathParams, PathTemplate};
use crate::model::HttpMethod;
use bytes::Bytes;
use http::StatusCode;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Message used when the transport gives no detail.
const GENERIC_FAILURE: &str = "upstream request failed";

/// A successful upstream response.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Forwards requests to an upstream service.
#[derive(Debug, Clone)]
pub struct ProxyForwarder {
    client: Client,
    timeout: Duration,
}

impl ProxyForwarder {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client, timeout }
    }

    /// Build the upstream URL: path placeholders filled from `params`, the
    /// incoming query merged over the mode's own query.
    pub fn upstream_url(mode: &str, params: &PathParams, query: &[(String, String)]) -> MockResult<Url> {
        let mut url = Url::parse(mode.trim())
            .map_err(|e| MockError::UpstreamFailure(format!("invalid upstream url: {}", e)))?;

        let raw_path = urlencoding::decode(url.path())
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| url.path().to_string());
        let template = PathTemplate::parse(&raw_path)
            .map_err(|e| MockError::UpstreamFailure(e.to_string()))?;
        let path = template.render(params).map_err(MockError::UpstreamFailure)?;
        url.set_path(&path);

        let mut merged: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        for (key, value) in query {
            merged.retain(|(k, _)| k != key);
            merged.push((key.clone(), value.clone()));
        }
        if merged.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(merged);
        }

        Ok(url)
    }

    /// Issue the upstream request.
    ///
    /// Non-2xx responses, timeouts and transport errors all fail with
    /// `UpstreamFailure`.
    pub async fn forward(
        &self,
        mode: &str,
        method: HttpMethod,
        params: &PathParams,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> MockResult<ProxyResponse> {
        let url = Self::upstream_url(mode, params, query)?;
        debug!(upstream = %url, method = %method, "Forwarding to upstream");

        let mut request = self.client.request(method.to_http(), url);
        if let Some(body) = body.filter(|_| method != HttpMethod::Get) {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MockError::UpstreamFailure(format!(
                "Request failed with status code {}",
                status.as_u16()
            )));
        }

        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;

        Ok(ProxyResponse {
            status,
            content_type,
            body,
        })
    }

    fn transport_error(&self, error: reqwest::Error) -> MockError {
        if error.is_timeout() {
            return MockError::UpstreamFailure(format!(
                "timeout of {}ms exceeded",
                self.timeout.as_millis()
            ));
        }
        let message = error.to_string();
        if message.is_empty() {
            MockError::UpstreamFailure(GENERIC_FAILURE.to_string())
        } else {
            MockError::UpstreamFailure(message)
        }
    }
}
