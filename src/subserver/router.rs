//! Call router: forwards namespaced tool calls to their sub-server.
//!
//! Steps:
//! 1. Split `server__tool` at the first separator
//! 2. Check the server exists and is `running`
//! 3. Check the tool was advertised and the arguments carry its required fields
//! 4. Send `tools/call` over the server's channel and return its `result`

use std::time::{Duration, Instant};

use super::catalog::split_qualified;
use super::errors::HostError;
use super::registry::{Lookup, ServerRegistry};
use super::types::{ToolDescriptor, METHOD_TOOLS_CALL};

/// Invoke `qualified_name` with `arguments`, waiting at most `timeout`.
///
/// Returns the sub-server's `result` payload verbatim.
pub async fn invoke(
    registry: &ServerRegistry,
    qualified_name: &str,
    arguments: serde_json::Value,
    timeout: Duration,
) -> Result<serde_json::Value, HostError> {
    let (server_name, tool_name) =
        split_qualified(qualified_name).ok_or(HostError::UnknownServer {
            qualified_name: qualified_name.to_string(),
        })?;

    let route = match registry.route(server_name).await {
        Lookup::Running(route) => route,
        Lookup::Absent => {
            return Err(HostError::UnknownServer {
                qualified_name: qualified_name.to_string(),
            })
        }
        Lookup::Inactive(status) => {
            return Err(HostError::ServerNotRunning {
                name: server_name.to_string(),
                status: status.to_string(),
            })
        }
    };

    let tool = route
        .tools
        .iter()
        .find(|t| t.name == tool_name)
        .ok_or(HostError::UnknownTool {
            name: qualified_name.to_string(),
        })?;
    validate_arguments(qualified_name, tool, &arguments)?;

    let start = Instant::now();
    let params = serde_json::json!({
        "name": tool_name,
        "arguments": arguments,
    });

    let result = route
        .channel
        .request(METHOD_TOOLS_CALL, Some(params), timeout)
        .await
        .map_err(|e| match e {
            HostError::CallTimeout {
                server, timeout_ms, ..
            } => HostError::CallTimeout {
                server,
                target: qualified_name.to_string(),
                timeout_ms,
            },
            other => other,
        });

    let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    match &result {
        Ok(_) => tracing::debug!(tool = qualified_name, elapsed_ms, "tool call completed"),
        Err(e) => tracing::warn!(tool = qualified_name, elapsed_ms, error = %e, "tool call failed"),
    }
    result
}

/// Structural argument check against the tool's input schema.
///
/// Arguments must be a JSON object and contain every `required` field.
/// Full JSON Schema validation is left to the sub-server.
pub fn validate_arguments(
    qualified_name: &str,
    tool: &ToolDescriptor,
    arguments: &serde_json::Value,
) -> Result<(), HostError> {
    let args_obj = arguments.as_object().ok_or(HostError::InvalidArguments {
        tool: qualified_name.to_string(),
        reason: "arguments must be a JSON object".into(),
    })?;

    if let Some(required) = tool.input_schema.get("required").and_then(|r| r.as_array()) {
        for field_name in required.iter().filter_map(|f| f.as_str()) {
            if !args_obj.contains_key(field_name) {
                return Err(HostError::InvalidArguments {
                    tool: qualified_name.to_string(),
                    reason: format!("missing required field: '{field_name}'"),
                });
            }
        }
    }

    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
