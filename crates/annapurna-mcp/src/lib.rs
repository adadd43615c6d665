//! MCP tool server for Annapurna retrieval.
//!
//! Exposes one tool, `annapurna`, to MCP clients over an SSE session
//! transport. Each call is proxied to the retrieval API of one retriever
//! using an OAuth2 token negotiated once at startup.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  SSE/POST  ┌──────────────┐  Bearer  ┌────────────────┐
//! │ MCP client │───────────▶│ session loop │─────────▶│ retrieval API  │
//! │            │◀───────────│ ToolHandler  │◀─────────│                │
//! └────────────┘            └──────────────┘          └────────────────┘
//! ```
//!
//! # Startup
//!
//! ```no_run
//! use annapurna_mcp::{bootstrap, serve, AnnapurnaConfig, McpHttpState, StdinCodeReceiver};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AnnapurnaConfig::new("https://rsc.example.com", "ret-1", "id", "secret");
//! let handler = bootstrap(&config, &StdinCodeReceiver).await?;
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//! let state = McpHttpState::new(handler, annapurna_mcp::MESSAGES_PATH);
//! serve(listener, state, async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credentials;
mod error;
pub mod handler;
pub mod http_serve;
pub mod oauth;
pub mod protocol;
pub mod receiver;
mod startup;
pub mod tool;
pub mod upstream;

pub use config::AnnapurnaConfig;
pub use credentials::{CredentialSet, SharedCredentials};
pub use error::{
    AnnapurnaError, AnnapurnaResult, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND,
    PARSE_ERROR,
};
pub use handler::ToolHandler;
pub use http_serve::{
    create_mcp_router, serve, DeliveryError, McpHttpState, SessionState, MESSAGES_PATH, SSE_PATH,
};
pub use oauth::{negotiate, OAuthClient, PkcePair, TokenRefresher};
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpTool, RequestId, ToolCallResult};
pub use receiver::{AuthorizationCodeReceiver, LoopbackCodeReceiver, StdinCodeReceiver};
pub use startup::bootstrap;
pub use upstream::RetrievalClient;
