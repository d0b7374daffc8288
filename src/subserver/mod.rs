//! Sub-server host: runs tool servers as sandboxed child processes and
//! multiplexes JSON-RPC over their stdio.
//!
//! This module handles:
//! - Launching container images with a fixed resource envelope
//! - Line-delimited JSON-RPC with one reader and a pending table per server
//! - One-shot tool discovery and the namespaced (`server__tool`) catalog
//! - Routing namespaced calls to the owning server with per-call deadlines
//! - Tracking `launching → running → stopped | error` per server

pub mod catalog;
pub mod discovery;
pub mod errors;
pub mod host;
pub mod pending;
pub mod registry;
pub mod router;
pub mod secrets;
pub mod supervisor;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{host_management_tools, BuiltinCatalog, StaticCatalog};
pub use errors::HostError;
pub use host::SubServerHost;
pub use supervisor::{ContainerLauncher, ProcessLauncher};
pub use types::{AttachOutcome, AttachRequest, ServerStatus, ServerSummary, ToolDescriptor};
