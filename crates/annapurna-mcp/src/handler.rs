//! Tool invocation handler.
//!
//! Validates a `tools/call`, proxies the query to the retrieval API with the
//! process credentials, and hands back the response body untouched.

use crate::credentials::SharedCredentials;
use crate::error::AnnapurnaResult;
use crate::oauth::TokenRefresher;
use crate::protocol::{McpTool, ToolCallResult};
use crate::tool;
use crate::upstream::{is_unauthorized, RetrievalClient};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared by every session; holds no per-call state.
#[derive(Debug, Clone)]
pub struct ToolHandler {
    client: RetrievalClient,
    credentials: SharedCredentials,
    refresher: Option<Arc<TokenRefresher>>,
}

impl ToolHandler {
    pub fn new(client: RetrievalClient, credentials: SharedCredentials) -> Self {
        Self {
            client,
            credentials,
            refresher: None,
        }
    }

    /// Refresh the token once and repeat the call when the retrieval API
    /// answers 401.
    pub fn with_refresher(mut self, refresher: Arc<TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn credentials(&self) -> &SharedCredentials {
        &self.credentials
    }

    pub fn list_tools(&self) -> Vec<McpTool> {
        tool::list_tools()
    }

    /// Execute one tool invocation.
    ///
    /// Validation happens before any network traffic.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<&Value>,
    ) -> AnnapurnaResult<ToolCallResult> {
        let query = tool::validate_invocation(name, arguments)?;
        debug!(tool = %name, query_len = query.len(), "Calling retrieval API");

        let token = self.credentials.access_token().await;
        let body = match (self.client.retrieve(&token, &query).await, &self.refresher) {
            (Err(e), Some(refresher)) if is_unauthorized(&e) => {
                info!("Retrieval API rejected the access token, refreshing");
                if let Err(refresh_err) = refresher.refresh(&token).await {
                    warn!(error = %refresh_err, "Token refresh failed");
                    return Err(e);
                }
                let token = self.credentials.access_token().await;
                self.client.retrieve(&token, &query).await?
            }
            (result, _) => result?,
        };

        Ok(ToolCallResult::text(body))
    }
}
