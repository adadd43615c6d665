//! `annapurna serve`: negotiate credentials, then serve MCP sessions.

use annapurna_mcp::config::DEFAULT_REDIRECT_URL;
use annapurna_mcp::{
    bootstrap, serve, AnnapurnaConfig, AuthorizationCodeReceiver, LoopbackCodeReceiver,
    McpHttpState, StdinCodeReceiver, MESSAGES_PATH, SSE_PATH,
};
use anyhow::Context;
use clap::{Args, ValueEnum};
use std::time::Duration;
use tracing::{error, info};

/// How the authorization code gets back to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CodeReceiverKind {
    /// Print the URL and read the code (or pasted redirect URL) from stdin
    Stdin,
    /// Listen on the redirect URL for the browser redirect
    Loopback,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Interface to listen on
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Base URL of the Annapurna deployment
    #[arg(long, env = "ANNAPURNA_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Retriever to expose
    #[arg(long, env = "ANNAPURNA_RETRIEVER_ID")]
    pub retriever_id: Option<String>,

    /// OAuth client id
    #[arg(long, env = "ANNAPURNA_CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth client secret
    #[arg(long, env = "ANNAPURNA_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Redirect URL registered for the OAuth client
    #[arg(long, env = "ANNAPURNA_REDIRECT_URL", default_value = DEFAULT_REDIRECT_URL)]
    pub redirect_url: String,

    /// Timeout for each retrieval call, in seconds
    #[arg(long, env = "ANNAPURNA_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Refresh the access token once and retry when the retrieval API answers 401
    #[arg(
        long,
        env = "ANNAPURNA_REFRESH_ON_401",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub refresh_on_401: bool,

    /// Require this key (X-API-Key or Bearer) from MCP clients
    #[arg(long, env = "ANNAPURNA_MCP_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Where to receive the authorization code
    #[arg(long, value_enum, default_value = "stdin")]
    pub code_receiver: CodeReceiverKind,
}

impl ServeArgs {
    /// Build the library configuration. Missing values are caught by
    /// validation during startup.
    pub fn to_config(&self) -> AnnapurnaConfig {
        AnnapurnaConfig::new(
            self.endpoint.clone().unwrap_or_default(),
            self.retriever_id.clone().unwrap_or_default(),
            self.client_id.clone().unwrap_or_default(),
            self.client_secret.clone().unwrap_or_default(),
        )
        .with_redirect_url(self.redirect_url.clone())
        .with_upstream_timeout(Duration::from_secs(self.timeout_secs))
        .with_refresh_on_unauthorized(self.refresh_on_401)
    }
}

/// Run the MCP server until Ctrl-C.
///
/// Nothing listens on `host:port` until the token exchange has succeeded.
pub async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.to_config();
    config.validate().context("Invalid configuration")?;

    let receiver: Box<dyn AuthorizationCodeReceiver> = match args.code_receiver {
        CodeReceiverKind::Stdin => Box::new(StdinCodeReceiver),
        CodeReceiverKind::Loopback => Box::new(
            LoopbackCodeReceiver::bind(&config.redirect_url)
                .await
                .context("Failed to start OAuth callback listener")?,
        ),
    };

    let handler = bootstrap(&config, receiver.as_ref())
        .await
        .context("Authorization failed")?;
    drop(receiver);

    let mut state = McpHttpState::new(handler, MESSAGES_PATH);
    if let Some(key) = args.api_key {
        state = state.with_api_key(key);
    }

    let address = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    info!(
        "Annapurna MCP server listening on http://{}{}",
        listener.local_addr()?,
        SSE_PATH
    );

    serve(listener, state, shutdown_signal()).await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }
}
