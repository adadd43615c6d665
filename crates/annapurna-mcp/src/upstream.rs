//! Client for the Annapurna retrieval API.

use crate::config::AnnapurnaConfig;
use crate::error::{AnnapurnaError, AnnapurnaResult};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Posts queries to one retriever's `retrieve` endpoint.
#[derive(Debug, Clone)]
pub struct RetrievalClient {
    url: String,
    client: Client,
}

impl RetrievalClient {
    /// Create a client for an explicit retrieval URL.
    pub fn new(url: impl Into<String>, timeout: Duration) -> AnnapurnaResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AnnapurnaError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }

    /// Create a client for the retriever named in the configuration.
    pub fn from_config(config: &AnnapurnaConfig) -> AnnapurnaResult<Self> {
        Self::new(config.retrieve_url(), config.upstream_timeout)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run one retrieval and return the raw response body.
    ///
    /// Non-2xx responses become [`AnnapurnaError::UpstreamRetrieval`];
    /// a 401 is not treated specially here.
    pub async fn retrieve(&self, access_token: &str, query: &str) -> AnnapurnaResult<String> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await
            .map_err(|e| AnnapurnaError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AnnapurnaError::UpstreamUnavailable(e.to_string()))?;

        debug!(status = status.as_u16(), body_len = body.len(), "Retrieval response");

        if !status.is_success() {
            return Err(AnnapurnaError::UpstreamRetrieval {
                status: status.as_u16(),
                body,
            });
        }

        Ok(body)
    }
}

/// Whether an error is the upstream telling us the token is no good.
pub fn is_unauthorized(error: &AnnapurnaError) -> bool {
    matches!(
        error,
        AnnapurnaError::UpstreamRetrieval { status, .. } if *status == StatusCode::UNAUTHORIZED.as_u16()
    )
}
