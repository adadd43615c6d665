//! `annapurna retrieve`: one retrieval with a static API key.

use annapurna_mcp::config::{retrieve_url, DEFAULT_NAMESPACE, DEFAULT_UPSTREAM_TIMEOUT_SECS};
use annapurna_mcp::RetrievalClient;
use anyhow::Context;
use clap::Args;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Args)]
pub struct RetrieveArgs {
    /// Retriever to query
    pub retriever_id: String,

    /// Query words, joined with spaces
    #[arg(required = true, num_args = 1..)]
    pub query: Vec<String>,

    /// Base URL of the Annapurna deployment
    #[arg(long, env = "ANNAPURNA_ENDPOINT")]
    pub endpoint: String,

    /// API key sent as the bearer token
    #[arg(long, env = "ANNAPURNA_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Timeout for the call, in seconds
    #[arg(long, env = "ANNAPURNA_TIMEOUT_SECS", default_value_t = DEFAULT_UPSTREAM_TIMEOUT_SECS)]
    pub timeout_secs: u64,
}

/// Run one retrieval and print the response body to stdout.
pub async fn run_retrieve(args: RetrieveArgs) -> anyhow::Result<()> {
    let url = retrieve_url(&args.endpoint, DEFAULT_NAMESPACE, &args.retriever_id);
    let query = args.query.join(" ");
    debug!(url = %url, "Running one-shot retrieval");

    let client = RetrievalClient::new(url, Duration::from_secs(args.timeout_secs))?;
    let body = client
        .retrieve(&args.api_key, &query)
        .await
        .context("Retrieval failed")?;

    println!("{body}");
    Ok(())
}
