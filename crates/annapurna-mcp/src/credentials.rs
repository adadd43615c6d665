//! Process-wide credential store.
//!
//! The token pair obtained at startup is read concurrently by every session.
//! Writes go through [`SharedCredentials::replace`] only.

use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Access/refresh token pair obtained from one token exchange.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct CredentialSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl CredentialSet {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
        }
    }
}

impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Cloneable handle to the credential set.
#[derive(Debug, Clone)]
pub struct SharedCredentials {
    inner: Arc<RwLock<CredentialSet>>,
}

impl SharedCredentials {
    pub fn new(credentials: CredentialSet) -> Self {
        Self {
            inner: Arc::new(RwLock::new(credentials)),
        }
    }

    /// Current access token.
    pub async fn access_token(&self) -> String {
        self.inner.read().await.access_token.clone()
    }

    /// Current refresh token, if the authorization server issued one.
    pub async fn refresh_token(&self) -> Option<String> {
        self.inner.read().await.refresh_token.clone()
    }

    /// Swap in a new credential set.
    ///
    /// A refresh response may omit the refresh token; the previous one is kept.
    pub async fn replace(&self, credentials: CredentialSet) {
        let mut current = self.inner.write().await;
        let refresh_token = credentials
            .refresh_token
            .or_else(|| current.refresh_token.take());
        *current = CredentialSet {
            access_token: credentials.access_token,
            refresh_token,
        };
        info!("Replaced access token");
    }
}
