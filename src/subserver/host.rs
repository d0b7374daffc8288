//! Sub-server host: high-level interface for attaching and calling sub-servers.
//!
//! Orchestrates the supervisor, transport, discovery, registry, and router.
//! This is the API the outer tool-dispatch surface uses.

use std::sync::Arc;
use std::time::Duration;

use super::catalog::{self, BuiltinCatalog};
use super::discovery::{self, DEFAULT_DISCOVERY_TIMEOUT};
use super::errors::HostError;
use super::registry::ServerRegistry;
use super::router;
use super::secrets::SecretPolicy;
use super::supervisor::{ProcessHandle, ProcessLauncher, Supervisor};
use super::transport::StdioChannel;
use super::types::{
    AttachOutcome, AttachRequest, ServerInstance, ServerStatus, ServerSummary, ToolDescriptor,
};
use crate::config::HostConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for tool call execution (ms).
const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Default container label when none is configured.
const DEFAULT_LABEL: &str = "toolhost.managed=true";

// ─── SubServerHost ───────────────────────────────────────────────────────────

/// Owns the registry and everything needed to launch and reach sub-servers.
pub struct SubServerHost {
    registry: Arc<ServerRegistry>,
    supervisor: Supervisor,
    builtins: Arc<dyn BuiltinCatalog>,
    secrets: SecretPolicy,
    discovery_timeout: Duration,
    call_timeout: Duration,
}

impl SubServerHost {
    /// Create a host with default timeouts and no scoped secrets.
    pub fn new(launcher: Arc<dyn ProcessLauncher>, builtins: Arc<dyn BuiltinCatalog>) -> Self {
        Self {
            registry: Arc::new(ServerRegistry::new()),
            supervisor: Supervisor::new(launcher, DEFAULT_LABEL),
            builtins,
            secrets: SecretPolicy::empty(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
        }
    }

    /// Create a host from loaded configuration.
    ///
    /// Secrets are resolved from the host environment once, here.
    pub fn from_config(
        config: &HostConfig,
        launcher: Arc<dyn ProcessLauncher>,
        builtins: Arc<dyn BuiltinCatalog>,
    ) -> Self {
        Self {
            registry: Arc::new(ServerRegistry::new()),
            supervisor: Supervisor::new(launcher, &config.label),
            builtins,
            secrets: SecretPolicy::from_host_env(&config.secrets),
            discovery_timeout: config.discovery_timeout(),
            call_timeout: config.call_timeout(),
        }
    }

    pub fn with_secrets(mut self, secrets: SecretPolicy) -> Self {
        self.secrets = secrets;
        self
    }

    /// Set the discovery handshake timeout.
    pub fn set_discovery_timeout(&mut self, timeout: Duration) {
        self.discovery_timeout = timeout;
    }

    /// Set the default tool call timeout.
    pub fn set_call_timeout(&mut self, timeout: Duration) {
        self.call_timeout = timeout;
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Launch a sub-server, discover its tools, and mark it running.
    ///
    /// Once the name is reserved it stays reserved even if a later step
    /// fails; the instance is left in `error` with the reason recorded.
    pub async fn attach(&self, request: AttachRequest) -> Result<AttachOutcome, HostError> {
        catalog::validate_server_name(&request.name)?;
        let name = request.name.clone();
        let image = request.resolved_image();

        let instance = self.registry.reserve(&name, &image).await?;
        tracing::info!(server = %name, image = %image, "attaching sub-server");

        let env = self.secrets.environment_for(&name, request.env);
        let handle = match self.supervisor.launch(&name, &image, env).await {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail(&instance, e).await),
        };

        let ProcessHandle {
            stdin,
            stdout,
            stderr,
            exited,
            kill,
        } = handle;
        let channel = StdioChannel::open(&name, stdin, stdout);
        self.supervisor
            .watch(Arc::clone(&self.registry), &name, instance.id, stderr, exited);

        if let Err(kill) = self
            .registry
            .attach_process(&name, instance.id, Arc::clone(&channel), kill)
            .await
        {
            // Detached while the image was pulling.
            kill.kill();
            return Err(HostError::ServerNotRunning {
                name,
                status: "detached".into(),
            });
        }

        let tools = match discovery::discover(&channel, self.discovery_timeout).await {
            Ok(tools) => tools,
            Err(e) => return Err(self.fail(&instance, e).await),
        };

        let tools_discovered = self.registry.mark_running(&name, instance.id, tools).await?;
        tracing::info!(server = %name, tool_count = tools_discovered, "sub-server running");

        Ok(AttachOutcome {
            name,
            image,
            tools_discovered,
        })
    }

    /// Attach several servers concurrently.
    ///
    /// Returns the servers that failed (partial startup is OK).
    pub async fn attach_all(&self, requests: &[AttachRequest]) -> Vec<(String, HostError)> {
        let attempts = requests.iter().map(|req| async move {
            let name = req.name.clone();
            self.attach(req.clone()).await.err().map(|e| (name, e))
        });
        futures::future::join_all(attempts)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Record `error` on the instance and hand the error back.
    async fn fail(&self, instance: &ServerInstance, error: HostError) -> HostError {
        tracing::warn!(server = %instance.name, error = %error, "sub-server attach failed");
        self.registry
            .set_status(
                &instance.name,
                instance.id,
                ServerStatus::Error,
                Some(error.to_string()),
            )
            .await;
        error
    }

    /// Remove a server from the registry and terminate its process.
    ///
    /// Returns the removed record, or `None` if the name was not attached.
    pub async fn detach(&self, name: &str) -> Option<ServerInstance> {
        let removed = self.registry.remove(name).await?;
        if let Some(kill) = removed.kill {
            kill.kill();
        }
        tracing::info!(server = %name, status = %removed.instance.status, "sub-server detached");
        Some(removed.instance)
    }

    /// Detach every server.
    pub async fn shutdown_all(&self) {
        for name in self.registry.names().await {
            self.detach(&name).await;
        }
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Invoke a namespaced tool with the default call timeout.
    pub async fn invoke(
        &self,
        qualified_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, HostError> {
        self.invoke_with_timeout(qualified_name, arguments, self.call_timeout)
            .await
    }

    /// Invoke a namespaced tool, failing with `CallTimeout` after `timeout`.
    pub async fn invoke_with_timeout(
        &self,
        qualified_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, HostError> {
        router::invoke(&self.registry, qualified_name, arguments, timeout).await
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Built-in tools followed by the tools of every running sub-server.
    pub async fn catalog(&self) -> Vec<ToolDescriptor> {
        let instances = self.registry.list().await;
        catalog::unified_catalog(self.builtins.as_ref(), &instances)
    }

    /// One summary row per attached server, sorted by name.
    pub async fn list(&self) -> Vec<ServerSummary> {
        self.registry
            .list()
            .await
            .iter()
            .map(ServerInstance::summary)
            .collect()
    }

    pub async fn get(&self, name: &str) -> Option<ServerInstance> {
        self.registry.get(name).await
    }

    /// Number of servers currently `running`.
    pub async fn running_server_count(&self) -> usize {
        self.registry
            .list()
            .await
            .iter()
            .filter(|inst| inst.status == ServerStatus::Running)
            .count()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
