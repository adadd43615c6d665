//! OAuth 2.0 Authorization Code flow with PKCE.
//!
//! The negotiator runs once at startup. It generates a verifier/challenge
//! pair, hands the authorization URL to an [`AuthorizationCodeReceiver`],
//! and exchanges the returned code together with the verifier for a
//! [`CredentialSet`]. The verifier is moved into the exchange and dropped
//! afterwards.

use crate::config::AnnapurnaConfig;
use crate::credentials::{CredentialSet, SharedCredentials};
use crate::error::{AnnapurnaError, AnnapurnaResult};
use crate::receiver::AuthorizationCodeReceiver;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Random bytes behind a code verifier. 96 bytes encode to 128 characters,
/// the longest verifier RFC 7636 allows.
pub const VERIFIER_BYTES: usize = 96;

/// Random bytes behind the state nonce.
pub const STATE_BYTES: usize = 16;

/// Timeout for authorization server calls.
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// PKCE code verifier. Not `Clone`; consumed by the token exchange.
pub struct CodeVerifier(String);

impl CodeVerifier {
    /// Generate a verifier from a cryptographically secure source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; VERIFIER_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// S256 challenge for this verifier.
    pub fn challenge(&self) -> String {
        code_challenge(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for CodeVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CodeVerifier(<redacted>)")
    }
}

/// Verifier together with its derived challenge.
#[derive(Debug)]
pub struct PkcePair {
    verifier: CodeVerifier,
    challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let verifier = CodeVerifier::generate();
        let challenge = verifier.challenge();
        Self {
            verifier,
            challenge,
        }
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    /// Give up the pair, keeping only the verifier for the exchange.
    pub fn into_verifier(self) -> CodeVerifier {
        self.verifier
    }
}

/// base64url(SHA-256(verifier)) without padding.
pub fn code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate an unpredictable state nonce for one authorization attempt.
pub fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build authorization URL.
pub fn build_auth_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: Option<&str>,
    state: &str,
    code_challenge: &str,
) -> String {
    let separator = if auth_endpoint.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}response_type=code&client_id={}&redirect_uri={}&state={}&code_challenge={}&code_challenge_method=S256",
        auth_endpoint,
        separator,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state),
        urlencoding::encode(code_challenge),
    );

    if let Some(scope) = scope.filter(|s| !s.is_empty()) {
        url.push_str(&format!("&scope={}", urlencoding::encode(scope)));
    }

    url
}

/// Client for one authorization server, authenticating with
/// `client_secret_post`.
#[derive(Clone)]
pub struct OAuthClient {
    authorize_endpoint: String,
    token_endpoint: String,
    client_id: String,
    client_secret: String,
    redirect_url: String,
    scopes: Vec<String>,
    http: reqwest::Client,
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient")
            .field("authorize_endpoint", &self.authorize_endpoint)
            .field("token_endpoint", &self.token_endpoint)
            .field("client_id", &self.client_id)
            .field("redirect_url", &self.redirect_url)
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl OAuthClient {
    /// Create a client for explicit endpoints.
    pub fn new(
        authorize_endpoint: impl Into<String>,
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_url: impl Into<String>,
        scopes: Vec<String>,
    ) -> AnnapurnaResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AnnapurnaError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            authorize_endpoint: authorize_endpoint.into(),
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_url: redirect_url.into(),
            scopes,
            http,
        })
    }

    /// Create a client for the endpoints of an Annapurna deployment.
    pub fn from_config(config: &AnnapurnaConfig) -> AnnapurnaResult<Self> {
        Self::new(
            config.authorize_endpoint(),
            config.token_endpoint(),
            config.client_id.clone(),
            config.client_secret.clone(),
            config.redirect_url.clone(),
            config.scopes.clone(),
        )
    }

    pub fn redirect_url(&self) -> &str {
        &self.redirect_url
    }

    /// Authorization URL for one attempt.
    pub fn authorization_url(&self, challenge: &str, state: &str) -> String {
        let scope = self.scopes.join(" ");
        build_auth_url(
            &self.authorize_endpoint,
            &self.client_id,
            &self.redirect_url,
            Some(&scope),
            state,
            challenge,
        )
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        verifier: CodeVerifier,
    ) -> AnnapurnaResult<CredentialSet> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_url.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code_verifier", verifier.as_str()),
        ];

        self.token_request(&params, "Token exchange").await
    }

    /// Refresh tokens using a refresh token.
    pub async fn refresh(&self, refresh_token: &str) -> AnnapurnaResult<CredentialSet> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        self.token_request(&params, "Token refresh").await
    }

    async fn token_request(
        &self,
        params: &[(&str, &str)],
        what: &str,
    ) -> AnnapurnaResult<CredentialSet> {
        let response = self
            .http
            .post(&self.token_endpoint)
            .form(params)
            .send()
            .await
            .map_err(|e| AnnapurnaError::authorization(format!("{what} request failed: {e}")))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(AnnapurnaError::authorization(format!(
                "{what} failed ({status}): {text}"
            )));
        }

        serde_json::from_str(&text).map_err(|e| {
            AnnapurnaError::authorization(format!("Invalid token response: {e}"))
        })
    }
}

/// Run the authorization code flow once and return the token pair.
pub async fn negotiate(
    client: &OAuthClient,
    receiver: &dyn AuthorizationCodeReceiver,
) -> AnnapurnaResult<CredentialSet> {
    let pkce = PkcePair::generate();
    let state = generate_state();
    let authorization_url = client.authorization_url(pkce.challenge(), &state);

    debug!(redirect_url = %client.redirect_url(), "Starting authorization code flow");

    let code = receiver.receive(&authorization_url, &state).await?;
    let credentials = client.exchange_code(&code, pkce.into_verifier()).await?;

    info!(
        has_refresh_token = credentials.refresh_token.is_some(),
        "Obtained access token"
    );
    Ok(credentials)
}

/// Single-writer refresh path for the shared credentials.
#[derive(Debug)]
pub struct TokenRefresher {
    client: OAuthClient,
    credentials: SharedCredentials,
    writer: Mutex<()>,
}

impl TokenRefresher {
    pub fn new(client: OAuthClient, credentials: SharedCredentials) -> Self {
        Self {
            client,
            credentials,
            writer: Mutex::new(()),
        }
    }

    /// Replace `stale_access_token` with a fresh one.
    ///
    /// Callers that lose the race see the token installed by the winner and
    /// do not refresh again.
    pub async fn refresh(&self, stale_access_token: &str) -> AnnapurnaResult<()> {
        let _writer = self.writer.lock().await;

        if self.credentials.access_token().await != stale_access_token {
            debug!("Access token already refreshed");
            return Ok(());
        }

        let Some(refresh_token) = self.credentials.refresh_token().await else {
            warn!("No refresh token available");
            return Err(AnnapurnaError::authorization("No refresh token available"));
        };

        let fresh = self.client.refresh(&refresh_token).await?;
        self.credentials.replace(fresh).await;
        Ok(())
    }
}
