//! The one tool this server exposes.

use crate::error::{AnnapurnaError, AnnapurnaResult};
use crate::protocol::McpTool;
use once_cell::sync::Lazy;
use serde_json::Value;

/// Registered tool name.
pub const TOOL_NAME: &str = "annapurna";

/// Name of the single required argument.
pub const QUERY_ARG: &str = "query";

const TOOL_DESCRIPTION: &str =
    "Returns a list of chunks providing more context for a given query";

const QUERY_DESCRIPTION: &str = "query to retrieve context for, pass the whole question";

static DESCRIPTOR: Lazy<McpTool> = Lazy::new(|| McpTool {
    name: TOOL_NAME.to_string(),
    description: Some(TOOL_DESCRIPTION.to_string()),
    input_schema: Some(serde_json::json!({
        "type": "object",
        "required": [QUERY_ARG],
        "properties": {
            QUERY_ARG: {
                "type": "string",
                "description": QUERY_DESCRIPTION,
            }
        },
        "additionalProperties": false,
    })),
});

/// Descriptor of the retrieval tool. Built once, never changes.
pub fn descriptor() -> &'static McpTool {
    &DESCRIPTOR
}

/// Everything `tools/list` advertises.
pub fn list_tools() -> Vec<McpTool> {
    vec![descriptor().clone()]
}

/// Check the tool name and pull the query out of the arguments.
///
/// Arguments must be an object with a string `query` and nothing else.
pub fn validate_invocation(name: &str, arguments: Option<&Value>) -> AnnapurnaResult<String> {
    if name != TOOL_NAME {
        return Err(AnnapurnaError::UnknownTool(name.to_string()));
    }

    let Some(args) = arguments.and_then(Value::as_object) else {
        return Err(AnnapurnaError::invalid_argument(format!(
            "Argument {QUERY_ARG} is required"
        )));
    };

    if let Some(extra) = args.keys().find(|k| k.as_str() != QUERY_ARG) {
        return Err(AnnapurnaError::invalid_argument(format!(
            "Unexpected argument {extra}"
        )));
    }

    match args.get(QUERY_ARG) {
        Some(Value::String(query)) => Ok(query.clone()),
        Some(_) => Err(AnnapurnaError::invalid_argument(format!(
            "Argument {QUERY_ARG} must be a string"
        ))),
        None => Err(AnnapurnaError::invalid_argument(format!(
            "Argument {QUERY_ARG} is required"
        ))),
    }
}
