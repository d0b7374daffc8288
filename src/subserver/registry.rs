//! Server registry: the authoritative table of attached sub-servers.
//!
//! Owns every [`ServerInstance`] record together with the live pieces of its
//! process (channel and kill handle). Other components change status only
//! through the methods here, and each mutation happens under one write lock
//! with no I/O inside it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::errors::HostError;
use super::supervisor::{ExitReport, KillHandle};
use super::transport::StdioChannel;
use super::types::{ServerInstance, ServerStatus, ToolDescriptor};

/// Registry row: the public record plus its process plumbing.
struct ServerEntry {
    instance: ServerInstance,
    channel: Option<Arc<StdioChannel>>,
    kill: Option<KillHandle>,
}

/// What the router needs to reach a running server.
#[derive(Clone)]
pub struct Route {
    pub channel: Arc<StdioChannel>,
    pub tools: Vec<ToolDescriptor>,
}

/// Result of looking a server up for routing.
pub enum Lookup {
    Absent,
    Inactive(ServerStatus),
    Running(Route),
}

/// A removed entry, returned so the caller can terminate its process.
pub struct Removed {
    pub instance: ServerInstance,
    pub kill: Option<KillHandle>,
}

/// Table of all attached sub-servers keyed by name.
#[derive(Default)]
pub struct ServerRegistry {
    servers: RwLock<HashMap<String, ServerEntry>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a `launching` record for `name`.
    ///
    /// Fails without side effects if the name is present in any status.
    pub async fn reserve(&self, name: &str, image: &str) -> Result<ServerInstance, HostError> {
        let mut servers = self.servers.write().await;
        if servers.contains_key(name) {
            return Err(HostError::AlreadyExists {
                name: name.to_string(),
            });
        }
        let instance = ServerInstance::launching(name, image);
        servers.insert(
            name.to_string(),
            ServerEntry {
                instance: instance.clone(),
                channel: None,
                kill: None,
            },
        );
        Ok(instance)
    }

    pub async fn get(&self, name: &str) -> Option<ServerInstance> {
        self.servers
            .read()
            .await
            .get(name)
            .map(|entry| entry.instance.clone())
    }

    /// Snapshot of all instances, sorted by name.
    pub async fn list(&self) -> Vec<ServerInstance> {
        let mut instances: Vec<ServerInstance> = self
            .servers
            .read()
            .await
            .values()
            .map(|entry| entry.instance.clone())
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        instances
    }

    pub async fn len(&self) -> usize {
        self.servers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Move instance `id` of `name` to `status` if the lifecycle allows it.
    ///
    /// Returns whether the transition was applied.
    pub async fn set_status(
        &self,
        name: &str,
        id: Uuid,
        status: ServerStatus,
        error: Option<String>,
    ) -> bool {
        let mut servers = self.servers.write().await;
        let Some(entry) = current_entry(&mut servers, name, id) else {
            return false;
        };
        apply_transition(&mut entry.instance, status, error)
    }

    /// Store the channel and kill handle of a freshly launched process.
    ///
    /// If the instance is gone (detached meanwhile) the kill handle is handed
    /// back so the caller can stop the orphaned process.
    pub async fn attach_process(
        &self,
        name: &str,
        id: Uuid,
        channel: Arc<StdioChannel>,
        kill: KillHandle,
    ) -> Result<(), KillHandle> {
        let mut servers = self.servers.write().await;
        match current_entry(&mut servers, name, id) {
            Some(entry) => {
                entry.channel = Some(channel);
                entry.kill = Some(kill);
                Ok(())
            }
            None => Err(kill),
        }
    }

    /// Record discovered tools and move `launching → running`.
    ///
    /// Returns the number of tools stored.
    pub async fn mark_running(
        &self,
        name: &str,
        id: Uuid,
        tools: Vec<ToolDescriptor>,
    ) -> Result<usize, HostError> {
        let mut servers = self.servers.write().await;
        let entry = current_entry(&mut servers, name, id).ok_or(HostError::ServerNotRunning {
            name: name.to_string(),
            status: "detached".to_string(),
        })?;

        if entry.instance.status != ServerStatus::Launching {
            return Err(HostError::ServerNotRunning {
                name: name.to_string(),
                status: entry.instance.status.to_string(),
            });
        }
        let count = tools.len();
        entry.instance.tools = tools;
        apply_transition(&mut entry.instance, ServerStatus::Running, None);
        Ok(count)
    }

    /// Apply a process exit to instance `id` of `name`.
    pub async fn record_exit(&self, name: &str, id: Uuid, report: &ExitReport) {
        let mut servers = self.servers.write().await;
        let Some(entry) = current_entry(&mut servers, name, id) else {
            return;
        };

        match entry.instance.status {
            ServerStatus::Running => {
                apply_transition(&mut entry.instance, ServerStatus::Stopped, None);
            }
            ServerStatus::Launching => {
                let message = match report.code {
                    Some(code) => {
                        format!("process exited before discovery completed (exit code {code})")
                    }
                    None => "process exited before discovery completed".to_string(),
                };
                apply_transition(&mut entry.instance, ServerStatus::Error, Some(message));
            }
            ServerStatus::Stopped | ServerStatus::Error => {}
        }
    }

    /// Look up the channel of a server for routing.
    pub async fn route(&self, name: &str) -> Lookup {
        let servers = self.servers.read().await;
        let Some(entry) = servers.get(name) else {
            return Lookup::Absent;
        };
        match (&entry.instance.status, &entry.channel) {
            (ServerStatus::Running, Some(channel)) => Lookup::Running(Route {
                channel: Arc::clone(channel),
                tools: entry.instance.tools.clone(),
            }),
            (status, _) => Lookup::Inactive(*status),
        }
    }

    /// Remove `name`, freeing it for reuse.
    pub async fn remove(&self, name: &str) -> Option<Removed> {
        self.servers
            .write()
            .await
            .remove(name)
            .map(|entry| Removed {
                instance: entry.instance,
                kill: entry.kill,
            })
    }

    /// All registered names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Entry for `name` only if it is still the instance identified by `id`.
fn current_entry<'a>(
    servers: &'a mut HashMap<String, ServerEntry>,
    name: &str,
    id: Uuid,
) -> Option<&'a mut ServerEntry> {
    servers
        .get_mut(name)
        .filter(|entry| entry.instance.id == id)
}

fn apply_transition(
    instance: &mut ServerInstance,
    status: ServerStatus,
    error: Option<String>,
) -> bool {
    if !instance.status.can_transition_to(status) {
        tracing::debug!(
            server = %instance.name,
            from = %instance.status,
            to = %status,
            "ignoring illegal status transition"
        );
        return false;
    }
    tracing::info!(
        server = %instance.name,
        from = %instance.status,
        to = %status,
        error = ?error,
        "sub-server status changed"
    );
    instance.status = status;
    if error.is_some() {
        instance.last_error = error;
    }
    true
}

// ─── Tests ───────────────────────────────────────────────────────────────────
