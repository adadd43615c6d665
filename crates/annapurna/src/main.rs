//! Annapurna - retrieval tool server for MCP clients.
//!
//! This is the main entry point for the annapurna CLI.

mod commands;

use clap::{Parser, Subcommand};
use commands::{init_logging, run_retrieve, run_serve, RetrieveArgs, ServeArgs};

#[derive(Parser)]
#[command(name = "annapurna")]
#[command(author, version, about = "Annapurna retrieval MCP server", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Server options, used when no subcommand is given
    #[command(flatten)]
    serve: ServeArgs,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Negotiate an access token, then serve MCP sessions over SSE (default)
    Serve(ServeArgs),
    /// Run one retrieval with an API key and print the result
    Retrieve(RetrieveArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Some(Commands::Serve(args)) => run_serve(args).await,
        Some(Commands::Retrieve(args)) => run_retrieve(args).await,
        None => run_serve(cli.serve).await,
    }
}
