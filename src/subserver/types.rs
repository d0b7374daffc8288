//! Shared types for the sub-server host.
//!
//! JSON-RPC envelopes spoken over sub-server stdio, plus the records the
//! registry and catalog hand out to callers.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// Method used for the one-time capability handshake.
pub const METHOD_TOOLS_LIST: &str = "tools/list";

/// Method used to invoke a sub-server tool.
pub const METHOD_TOOLS_CALL: &str = "tools/call";

/// JSON-RPC 2.0 request message.
///
/// Field order is the wire order: `jsonrpc`, `method`, `id`, `params`.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub id: u64,
    pub params: serde_json::Value,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request. `None` params are sent as `{}`.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            id,
            params: params.unwrap_or_else(|| serde_json::json!({})),
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: u64,
    /// Present only on server-initiated requests; such lines are not responses.
    #[serde(default)]
    pub method: Option<String>,
    /// `Some(Value::Null)` for `"result": null`; `None` only when absent.
    #[serde(default, deserialize_with = "present")]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tools ──────────────────────────────────────────────────────────────────

/// A callable tool as advertised by a sub-server or the built-in catalog.
///
/// Inside a [`ServerInstance`] the name is unqualified (`ping`); in the
/// unified catalog it is qualified (`echo__ping`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object", rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

impl ToolDescriptor {
    pub fn new(name: &str, description: &str, input_schema: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

/// Payload of a `tools/list` result.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

// ─── Server Records ─────────────────────────────────────────────────────────

/// Lifecycle status of an attached sub-server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Launching,
    Running,
    Stopped,
    Error,
}

impl ServerStatus {
    /// `stopped` and `error` are never left.
    pub fn is_terminal(self) -> bool {
        matches!(self, ServerStatus::Stopped | ServerStatus::Error)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ServerStatus) -> bool {
        matches!(
            (self, next),
            (ServerStatus::Launching, ServerStatus::Running)
                | (ServerStatus::Launching, ServerStatus::Error)
                | (ServerStatus::Running, ServerStatus::Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Launching => "launching",
            ServerStatus::Running => "running",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Error => "error",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attached sub-server as recorded by the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInstance {
    /// Distinguishes successive attaches that reuse a name.
    pub id: Uuid,
    pub name: String,
    pub image: String,
    pub status: ServerStatus,
    /// Unqualified tool descriptors, in discovery order.
    pub tools: Vec<ToolDescriptor>,
    pub last_error: Option<String>,
    pub attached_at: DateTime<Utc>,
}

impl ServerInstance {
    pub fn launching(name: &str, image: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            image: image.to_string(),
            status: ServerStatus::Launching,
            tools: Vec::new(),
            last_error: None,
            attached_at: Utc::now(),
        }
    }

    pub fn summary(&self) -> ServerSummary {
        ServerSummary {
            name: self.name.clone(),
            image: self.image.clone(),
            status: self.status,
            tool_count: self.tools.len(),
            last_error: self.last_error.clone(),
            attached_at: self.attached_at.to_rfc3339(),
        }
    }
}

/// Row returned by the list operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub name: String,
    pub image: String,
    pub status: ServerStatus,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub attached_at: String,
}

// ─── Attach ─────────────────────────────────────────────────────────────────

/// Input of the attach operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachRequest {
    pub name: String,
    /// Container image; defaults to `mcp/<name>` when absent.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl AttachRequest {
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: Some(image.to_string()),
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// The image to launch, falling back to the `mcp/<name>` convention.
    pub fn resolved_image(&self) -> String {
        match &self.image {
            Some(image) if !image.trim().is_empty() => image.clone(),
            _ => format!("mcp/{}", self.name),
        }
    }
}

/// Successful result of the attach operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachOutcome {
    pub name: String,
    pub image: String,
    pub tools_discovered: usize,
}

impl fmt::Display for AttachOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tools discovered: {}", self.tools_discovered)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
