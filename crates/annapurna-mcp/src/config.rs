//! Startup configuration.

use crate::error::{AnnapurnaError, AnnapurnaResult};
use std::time::Duration;

/// Namespace segment of the retrieval API path.
pub const DEFAULT_NAMESPACE: &str = "annapurna";

/// Scopes requested during authorization.
pub const DEFAULT_SCOPES: &[&str] = &["annapurna", "offline_access"];

/// Loopback address the authorization server redirects to.
pub const DEFAULT_REDIRECT_URL: &str = "http://localhost:3000";

/// Default request timeout for retrieval calls.
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;

/// Configuration shared by the negotiator and the invocation handler.
#[derive(Clone)]
pub struct AnnapurnaConfig {
    /// Base URL of the Annapurna deployment (authorization server and API).
    pub endpoint: String,
    /// Retriever to query.
    pub retriever_id: String,
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret, sent with `client_secret_post`.
    pub client_secret: String,
    /// API namespace in the retrieval path.
    pub namespace: String,
    /// Requested OAuth scopes.
    pub scopes: Vec<String>,
    /// Redirect URL registered for the client.
    pub redirect_url: String,
    /// Per-request timeout for retrieval calls.
    pub upstream_timeout: Duration,
    /// Refresh the access token once and repeat the call when the
    /// retrieval API answers 401. Off by default.
    pub refresh_on_unauthorized: bool,
}

/// `{endpoint}/api/{namespace}/{retriever_id}/retrieve`
pub fn retrieve_url(endpoint: &str, namespace: &str, retriever_id: &str) -> String {
    format!(
        "{}/api/{}/{}/retrieve",
        endpoint.trim_end_matches('/'),
        namespace,
        retriever_id
    )
}

impl std::fmt::Debug for AnnapurnaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnapurnaConfig")
            .field("endpoint", &self.endpoint)
            .field("retriever_id", &self.retriever_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("namespace", &self.namespace)
            .field("scopes", &self.scopes)
            .field("redirect_url", &self.redirect_url)
            .field("upstream_timeout", &self.upstream_timeout)
            .field("refresh_on_unauthorized", &self.refresh_on_unauthorized)
            .finish()
    }
}

impl AnnapurnaConfig {
    /// Create a configuration with defaults for everything but the
    /// deployment-specific values.
    pub fn new(
        endpoint: impl Into<String>,
        retriever_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            retriever_id: retriever_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            redirect_url: DEFAULT_REDIRECT_URL.to_string(),
            upstream_timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            refresh_on_unauthorized: false,
        }
    }

    /// Set the retrieval timeout.
    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    /// Set the redirect URL.
    pub fn with_redirect_url(mut self, redirect_url: impl Into<String>) -> Self {
        self.redirect_url = redirect_url.into();
        self
    }

    /// Enable refresh-and-repeat on 401.
    pub fn with_refresh_on_unauthorized(mut self, enabled: bool) -> Self {
        self.refresh_on_unauthorized = enabled;
        self
    }

    fn base(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }

    /// Authorization endpoint of the deployment.
    pub fn authorize_endpoint(&self) -> String {
        format!("{}/oauth_authorize", self.base())
    }

    /// Token endpoint of the deployment.
    pub fn token_endpoint(&self) -> String {
        format!("{}/api/oauth/token", self.base())
    }

    /// Retrieval endpoint for the configured retriever.
    pub fn retrieve_url(&self) -> String {
        retrieve_url(&self.endpoint, &self.namespace, &self.retriever_id)
    }

    /// Check that every required value is present and well-formed.
    pub fn validate(&self) -> AnnapurnaResult<()> {
        let required = [
            ("endpoint", &self.endpoint),
            ("retriever id", &self.retriever_id),
            ("client id", &self.client_id),
            ("client secret", &self.client_secret),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(AnnapurnaError::config(format!("missing {name}")));
            }
        }

        url::Url::parse(&self.endpoint)
            .map_err(|e| AnnapurnaError::config(format!("invalid endpoint: {e}")))?;
        url::Url::parse(&self.redirect_url)
            .map_err(|e| AnnapurnaError::config(format!("invalid redirect URL: {e}")))?;

        if self.upstream_timeout.is_zero() {
            return Err(AnnapurnaError::config("upstream timeout must be positive"));
        }

        Ok(())
    }
}
