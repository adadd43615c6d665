//! Error types.

use crate::protocol::JsonRpcError;
use thiserror::Error;

/// Result type for annapurna operations.
pub type AnnapurnaResult<T> = Result<T, AnnapurnaError>;

/// JSON-RPC code for invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;

/// JSON-RPC code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC code for an unparsable message.
pub const PARSE_ERROR: i64 = -32700;

/// JSON-RPC code for internal failures.
pub const INTERNAL_ERROR: i64 = -32603;

/// Errors that can occur while negotiating credentials or serving tool calls.
#[derive(Debug, Error)]
pub enum AnnapurnaError {
    /// The authorization or token endpoint refused us, or answered garbage.
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// A tool other than the registered one was invoked.
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Tool arguments do not match the input schema.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The retrieval API answered with a non-success status.
    #[error("Upstream retrieval failed with status {status}: {body}")]
    UpstreamRetrieval { status: u16, body: String },

    /// The retrieval API could not be reached (connect error, timeout).
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The session stream is closed or corrupted.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Startup configuration is incomplete or malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parse error.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl AnnapurnaError {
    /// Create an authorization error.
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this error is the outcome of a tool call, reported to the
    /// caller as an `isError` tool result instead of a JSON-RPC error.
    pub fn is_tool_failure(&self) -> bool {
        matches!(
            self,
            Self::UnknownTool(_)
                | Self::InvalidArgument(_)
                | Self::UpstreamRetrieval { .. }
                | Self::UpstreamUnavailable(_)
        )
    }

    /// Convert into a JSON-RPC error object.
    ///
    /// Used for requests that never reach the tool, such as undecodable params.
    pub fn rpc_error(&self) -> JsonRpcError {
        let code = match self {
            Self::UnknownTool(_) | Self::InvalidArgument(_) | Self::Json(_) => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        };
        JsonRpcError::new(code, self.to_string())
    }
}
