//! Process startup: obtain credentials, then build the shared handler.
//!
//! The listener must not be bound until [`bootstrap`] succeeds, so an
//! authorization failure leaves no server behind.

use crate::config::AnnapurnaConfig;
use crate::credentials::SharedCredentials;
use crate::error::AnnapurnaResult;
use crate::handler::ToolHandler;
use crate::oauth::{negotiate, OAuthClient, TokenRefresher};
use crate::receiver::AuthorizationCodeReceiver;
use crate::upstream::RetrievalClient;
use std::sync::Arc;
use tracing::info;

/// Validate the configuration, negotiate a token pair, and assemble the
/// handler every session will share.
pub async fn bootstrap(
    config: &AnnapurnaConfig,
    receiver: &dyn AuthorizationCodeReceiver,
) -> AnnapurnaResult<ToolHandler> {
    config.validate()?;

    let oauth = OAuthClient::from_config(config)?;
    let retrieval = RetrievalClient::from_config(config)?;

    let credentials = SharedCredentials::new(negotiate(&oauth, receiver).await?);
    let mut handler = ToolHandler::new(retrieval, credentials.clone());

    if config.refresh_on_unauthorized {
        info!("Refreshing the access token on 401 is enabled");
        handler = handler.with_refresher(Arc::new(TokenRefresher::new(oauth, credentials)));
    }

    info!(
        retriever_id = %config.retriever_id,
        endpoint = %config.endpoint,
        "Retrieval tool ready"
    );
    Ok(handler)
}
