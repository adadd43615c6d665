//! Logging initialization.

use tracing_subscriber::EnvFilter;

/// Initialize logging to stderr.
///
/// Stdout is left to the authorization prompt and `retrieve` output.
/// `RUST_LOG` takes precedence over `verbose`.
pub fn init_logging(verbose: bool) {
    let default = if verbose {
        "annapurna=debug,annapurna_mcp=debug,tower_http=debug"
    } else {
        "annapurna=info,annapurna_mcp=info,tower_http=info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
