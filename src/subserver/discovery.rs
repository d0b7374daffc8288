//! Capability discovery: the one-time `tools/list` handshake.
//!
//! Runs once per launched sub-server, right after its channel opens. There
//! is no retry and no later re-discovery: the tool list learned here is the
//! server's tool list for the rest of its life.

use std::time::Duration;

use super::catalog::is_valid_tool_name;
use super::errors::HostError;
use super::transport::StdioChannel;
use super::types::{ToolDescriptor, ToolsListResult, METHOD_TOOLS_LIST};

/// Default bound on the discovery round-trip.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Ask the sub-server behind `channel` for its tools.
pub async fn discover(
    channel: &StdioChannel,
    timeout: Duration,
) -> Result<Vec<ToolDescriptor>, HostError> {
    let name = channel.server_name().to_string();

    let result = channel
        .request(METHOD_TOOLS_LIST, None, timeout)
        .await
        .map_err(|e| match e {
            HostError::CallTimeout { timeout_ms, .. } => HostError::DiscoveryTimeout {
                name: name.clone(),
                timeout_ms,
            },
            HostError::ServerError { code, message, .. } => HostError::DiscoveryFailed {
                name: name.clone(),
                reason: format!("[{code}] {message}"),
            },
            other => other,
        })?;

    let list: ToolsListResult =
        serde_json::from_value(result).map_err(|e| HostError::DiscoveryFailed {
            name: name.clone(),
            reason: format!("failed to parse tools/list result: {e}"),
        })?;

    Ok(accept_tools(&name, list.tools))
}

/// Drop tools whose names cannot be namespaced unambiguously.
fn accept_tools(server_name: &str, tools: Vec<ToolDescriptor>) -> Vec<ToolDescriptor> {
    tools
        .into_iter()
        .filter(|tool| {
            let ok = is_valid_tool_name(&tool.name);
            if !ok {
                tracing::warn!(
                    server = server_name,
                    tool = %tool.name,
                    "ignoring tool with reserved or empty name"
                );
            }
            ok
        })
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
