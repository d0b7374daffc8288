//! Sub-server host error types.

use thiserror::Error;

/// Errors that can occur while attaching, routing to, or talking with
/// sub-servers.
#[derive(Debug, Error)]
pub enum HostError {
    /// A server with this name is already registered (in any status).
    #[error("server '{name}' already exists")]
    AlreadyExists { name: String },

    /// Server name is empty or contains the namespace separator.
    #[error("invalid server name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// The container image could not be retrieved.
    #[error("failed to pull image '{image}': {reason}")]
    ImagePullFailed { image: String, reason: String },

    /// The sandboxed process could not be started.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// No `tools/list` response arrived in time.
    #[error("server '{name}' did not answer tool discovery within {timeout_ms}ms")]
    DiscoveryTimeout { name: String, timeout_ms: u64 },

    /// The `tools/list` response was an error or could not be parsed.
    #[error("tool discovery failed for server '{name}': {reason}")]
    DiscoveryFailed { name: String, reason: String },

    /// The namespace prefix does not name any registered server.
    #[error("unknown server for tool '{qualified_name}'")]
    UnknownServer { qualified_name: String },

    /// The server exists but is not accepting calls.
    #[error("server '{name}' is not running (status: {status})")]
    ServerNotRunning { name: String, status: String },

    /// The server is running but never advertised this tool.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// Tool call arguments failed the structural schema check.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// A request's deadline elapsed before a matching response arrived.
    #[error("call '{target}' on server '{server}' timed out after {timeout_ms}ms")]
    CallTimeout {
        server: String,
        target: String,
        timeout_ms: u64,
    },

    /// I/O or framing failure on a sub-server's stdio.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// The sub-server answered with a JSON-RPC error object.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Host configuration could not be loaded.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl HostError {
    /// Whether a caller may reasonably retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HostError::CallTimeout { .. } | HostError::TransportError { .. }
        )
    }
}
