//! Sub-server process supervision.
//!
//! Pulls container images, starts sandboxed sub-server processes with a
//! fixed resource envelope, forwards their stderr to the host log, and
//! reports their exit back into the registry.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::errors::HostError;
use super::registry::ServerRegistry;
use super::transport::{BoxedReader, BoxedWriter};

// ─── Constants ───────────────────────────────────────────────────────────────

/// CPU share granted to every sub-server container.
pub const CPU_LIMIT: &str = "1";

/// Memory ceiling for every sub-server container.
pub const MEMORY_LIMIT: &str = "512m";

/// Environment variable declaring the transport the sub-server must speak.
pub const TRANSPORT_ENV: &str = "MCP_TRANSPORT";

/// Maximum length of runtime diagnostics carried in error messages.
const MAX_DIAGNOSTIC_CHARS: usize = 2000;

// ─── Launch Types ────────────────────────────────────────────────────────────

/// Everything needed to start one sub-server process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub server_name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    /// Unique container name, used to remove the container on kill.
    pub container_name: String,
    /// `key=value` label marking the container as host-managed.
    pub label: String,
}

/// How a sub-server process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    /// The host terminated the process (detach or shutdown).
    pub killed: bool,
}

impl ExitReport {
    fn from_wait(status: std::io::Result<std::process::ExitStatus>, killed: bool) -> Self {
        Self {
            code: status.ok().and_then(|s| s.code()),
            killed,
        }
    }
}

/// Terminates a sub-server process when fired or dropped.
#[derive(Debug)]
pub struct KillHandle(oneshot::Sender<()>);

impl KillHandle {
    pub fn pair() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn kill(self) {
        let _ = self.0.send(());
    }
}

/// A started sub-server process: its stdio plus lifecycle hooks.
pub struct ProcessHandle {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    /// Resolves once, when the process has exited.
    pub exited: oneshot::Receiver<ExitReport>,
    pub kill: KillHandle,
}

/// Starts sub-server processes.
///
/// The production implementation is [`ContainerLauncher`]; tests substitute
/// in-memory stubs.
pub trait ProcessLauncher: Send + Sync {
    fn launch<'a>(&'a self, spec: &'a LaunchSpec) -> BoxFuture<'a, Result<ProcessHandle, HostError>>;
}

// ─── Container Launcher ──────────────────────────────────────────────────────

/// Launches sub-servers through a docker-compatible runtime CLI.
#[derive(Debug, Clone)]
pub struct ContainerLauncher {
    runtime: String,
}

impl ContainerLauncher {
    pub fn new(runtime: &str) -> Self {
        Self {
            runtime: runtime.to_string(),
        }
    }

    /// Pull `image`, waiting for the pull to finish.
    async fn pull(&self, image: &str) -> Result<(), HostError> {
        tracing::info!(image, runtime = %self.runtime, "pulling sub-server image");

        let output = Command::new(&self.runtime)
            .args(["pull", image])
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| HostError::ImagePullFailed {
                image: image.to_string(),
                reason: format!("failed to run '{} pull': {e}", self.runtime),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HostError::ImagePullFailed {
                image: image.to_string(),
                reason: format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    truncate_diagnostic(stderr.trim())
                ),
            });
        }
        Ok(())
    }

    async fn run(&self, spec: &LaunchSpec) -> Result<ProcessHandle, HostError> {
        self.pull(&spec.image).await?;

        // Values go to the container only; the runtime CLI's own environment
        // is inherited from the host untouched.
        let env_file = write_env_file(&spec.server_name, &spec.env)?;

        let mut cmd = Command::new(&self.runtime);
        cmd.args(run_args(spec, env_file.as_ref().map(|f| f.path())));
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| HostError::SpawnFailed {
            name: spec.server_name.clone(),
            reason: format!("{e}"),
        })?;

        let stdin = child.stdin.take().ok_or(HostError::SpawnFailed {
            name: spec.server_name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(HostError::SpawnFailed {
            name: spec.server_name.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill, kill_rx) = KillHandle::pair();
        tokio::spawn(wait_for_exit(
            child,
            kill_rx,
            exit_tx,
            self.runtime.clone(),
            spec.container_name.clone(),
            env_file,
        ));

        tracing::info!(
            server = %spec.server_name,
            image = %spec.image,
            container = %spec.container_name,
            "sub-server container started"
        );

        Ok(ProcessHandle {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
            exited: exit_rx,
            kill,
        })
    }
}

impl ProcessLauncher for ContainerLauncher {
    fn launch<'a>(&'a self, spec: &'a LaunchSpec) -> BoxFuture<'a, Result<ProcessHandle, HostError>> {
        Box::pin(self.run(spec))
    }
}

/// Build the `run` invocation with the fixed sandbox envelope.
///
/// Per-server env is passed only through `env_file`; argv never carries it.
pub fn run_args(spec: &LaunchSpec, env_file: Option<&Path>) -> Vec<String> {
    let mut args: Vec<String> = [
        "run",
        "-i",
        "--rm",
        "--name",
        spec.container_name.as_str(),
        "--label",
        spec.label.as_str(),
        "--cpus",
        CPU_LIMIT,
        "--memory",
        MEMORY_LIMIT,
        "--security-opt",
        "no-new-privileges",
        "-e",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("{TRANSPORT_ENV}=stdio"));

    if let Some(path) = env_file {
        args.push("--env-file".to_string());
        args.push(path.display().to_string());
    }

    args.push(spec.image.clone());
    args
}

/// Write `env` as a `KEY=value` env-file readable only by the host user.
///
/// Returns `None` for an empty env. Keys are sorted. Values cannot span
/// lines in this format, so a key or value containing a newline (or a key
/// containing `=`) is rejected.
fn write_env_file(
    server_name: &str,
    env: &HashMap<String, String>,
) -> Result<Option<NamedTempFile>, HostError> {
    if env.is_empty() {
        return Ok(None);
    }
    let spawn_failed = |reason: String| HostError::SpawnFailed {
        name: server_name.to_string(),
        reason,
    };

    let sorted: BTreeMap<&String, &String> = env.iter().collect();
    let mut contents = String::new();
    for (key, value) in sorted {
        if key.is_empty() || key.contains(['=', '\n', '\r']) {
            return Err(spawn_failed(format!("invalid environment variable name {key:?}")));
        }
        if value.contains(['\n', '\r']) {
            return Err(spawn_failed(format!("value of '{key}' contains a line break")));
        }
        contents.push_str(&format!("{key}={value}\n"));
    }

    // NamedTempFile is created with mode 0600 on unix.
    let mut file = tempfile::Builder::new()
        .prefix("toolhost-env-")
        .tempfile()
        .map_err(|e| spawn_failed(format!("failed to create env file: {e}")))?;
    file.write_all(contents.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| spawn_failed(format!("failed to write env file: {e}")))?;
    Ok(Some(file))
}

/// Wait for the child to exit, or kill it when the handle fires or drops.
///
/// The env-file lives until the CLI exits, so it is never removed before the
/// runtime has read it.
async fn wait_for_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<ExitReport>,
    runtime: String,
    container_name: String,
    env_file: Option<NamedTempFile>,
) {
    let report = tokio::select! {
        status = child.wait() => ExitReport::from_wait(status, false),
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(container = %container_name, error = %e, "kill signal failed");
            }
            remove_container(&runtime, &container_name).await;
            ExitReport::from_wait(child.wait().await, true)
        }
    };
    drop(env_file);
    let _ = exit_tx.send(report);
}

/// Force-remove a container; killing the CLI alone may leave it running.
async fn remove_container(runtime: &str, container_name: &str) {
    let result = Command::new(runtime)
        .args(["rm", "-f", container_name])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        tracing::warn!(container = %container_name, error = %e, "failed to remove container");
    }
}

/// Truncate runtime diagnostics to keep error messages readable.
fn truncate_diagnostic(text: &str) -> String {
    match text.char_indices().nth(MAX_DIAGNOSTIC_CHARS) {
        Some((idx, _)) => format!("{}...(truncated)", &text[..idx]),
        None => text.to_string(),
    }
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// Launches sub-servers and keeps the registry informed of their exit.
pub struct Supervisor {
    launcher: Arc<dyn ProcessLauncher>,
    label: String,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, label: &str) -> Self {
        Self {
            launcher,
            label: label.to_string(),
        }
    }

    /// Launch `image` for server `name` with the given environment.
    pub async fn launch(
        &self,
        name: &str,
        image: &str,
        env: HashMap<String, String>,
    ) -> Result<ProcessHandle, HostError> {
        let spec = LaunchSpec {
            server_name: name.to_string(),
            image: image.to_string(),
            env,
            container_name: container_name_for(name),
            label: self.label.clone(),
        };
        self.launcher.launch(&spec).await
    }

    /// Observe a launched process for the rest of its life.
    ///
    /// Stderr goes to the host log; exit is recorded against instance `id`.
    pub fn watch(
        &self,
        registry: Arc<ServerRegistry>,
        name: &str,
        id: Uuid,
        stderr: Option<BoxedReader>,
        exited: oneshot::Receiver<ExitReport>,
    ) {
        if let Some(stderr) = stderr {
            forward_diagnostics(name.to_string(), stderr);
        }

        let name = name.to_string();
        tokio::spawn(async move {
            let report = exited.await.unwrap_or(ExitReport {
                code: None,
                killed: false,
            });
            if report.killed {
                tracing::info!(server = %name, exit_code = ?report.code, "sub-server terminated by host");
            } else {
                tracing::warn!(server = %name, exit_code = ?report.code, "sub-server process exited");
            }
            registry.record_exit(&name, id, &report).await;
        });
    }
}

/// Unique container name for a server: `toolhost-<name>-<8 hex>`.
fn container_name_for(server_name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("toolhost-{server_name}-{}", &suffix[..8])
}

/// Forward each stderr line to the host log. Never parsed.
fn forward_diagnostics(server: String, stderr: BoxedReader) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::info!(target: "toolhost::subserver::stderr", server = %server, "{line}");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "stderr read ended");
                    break;
                }
            }
        }
    });
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(env: &[(&str, &str)]) -> LaunchSpec {
        LaunchSpec {
            server_name: "github".into(),
            image: "mcp/github:latest".into(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            container_name: "toolhost-github-0a1b2c3d".into(),
            label: "toolhost.managed=true".into(),
        }
    }

    #[test]
    fn test_run_args_fixed_envelope() {
        let args = run_args(&spec(&[]), None);
        let joined = args.join(" ");
        assert!(joined.starts_with("run -i --rm --name toolhost-github-0a1b2c3d"));
        assert!(joined.contains("--label toolhost.managed=true"));
        assert!(joined.contains("--cpus 1"));
        assert!(joined.contains("--memory 512m"));
        assert!(joined.contains("--security-opt no-new-privileges"));
        assert!(joined.contains("-e MCP_TRANSPORT=stdio"));
        assert_eq!(args.last().unwrap(), "mcp/github:latest");
    }

    #[test]
    fn test_run_args_env_only_through_file() {
        let spec = spec(&[("ZETA", "z"), ("GITHUB_TOKEN", "secret")]);
        let args = run_args(&spec, Some(Path::new("/tmp/toolhost-env-abc")));
        let joined = args.join(" ");
        assert!(!joined.contains("secret"));
        assert!(!joined.contains("GITHUB_TOKEN"));
        assert!(joined.contains("--env-file /tmp/toolhost-env-abc"));
        // Image stays last so nothing is passed as a container argument.
        assert_eq!(args.last().unwrap(), "mcp/github:latest");
    }

    #[test]
    fn test_env_file_contents_sorted() {
        let env = spec(&[("ZETA", "z"), ("GITHUB_TOKEN", "ghp secret=1")]).env;
        let file = write_env_file("github", &env).unwrap().unwrap();
        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(contents, "GITHUB_TOKEN=ghp secret=1\nZETA=z\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(file.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o077, 0);
        }
    }

    #[test]
    fn test_env_file_rejects_line_breaks() {
        assert!(write_env_file("github", &HashMap::new()).unwrap().is_none());

        let env = spec(&[("TOKEN", "a\nINJECTED=1")]).env;
        let err = write_env_file("github", &env).unwrap_err();
        assert!(matches!(err, HostError::SpawnFailed { .. }));

        let env = spec(&[("A=B", "x")]).env;
        assert!(write_env_file("github", &env).is_err());
    }

    /// Runtime stand-in: `pull` succeeds, `run` records what it saw.
    #[cfg(unix)]
    fn recording_runtime(dir: &Path) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-runtime.sh");
        let record = dir.join("record.txt");
        let body = format!(
            r#"#!/bin/sh
[ "$1" = "pull" ] && exit 0
echo "DOCKER_HOST=${{DOCKER_HOST:-unset}}" > "{record}"
while [ $# -gt 0 ]; do
  if [ "$1" = "--env-file" ]; then cat "$2" >> "{record}"; fi
  shift
done
"#,
            record = record.display()
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_attach_env_does_not_reach_runtime_cli() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = recording_runtime(dir.path());
        let launcher = ContainerLauncher::new(&runtime.display().to_string());

        let handle = launcher
            .launch(&spec(&[("DOCKER_HOST", "tcp://elsewhere:2375")]))
            .await
            .map_err(|e| e.to_string())
            .unwrap();
        let report = handle.exited.await.unwrap();
        assert_eq!(report.code, Some(0));

        let record = std::fs::read_to_string(dir.path().join("record.txt")).unwrap();
        let mut lines = record.lines();
        let cli_view = lines.next().unwrap();
        assert_ne!(cli_view, "DOCKER_HOST=tcp://elsewhere:2375");
        // The container still gets it, through the env-file.
        assert_eq!(lines.next(), Some("DOCKER_HOST=tcp://elsewhere:2375"));
    }

    #[test]
    fn test_container_names_unique() {
        let a = container_name_for("echo");
        let b = container_name_for("echo");
        assert!(a.starts_with("toolhost-echo-"));
        assert_eq!(a.len(), "toolhost-echo-".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_truncate_diagnostic() {
        let long = "x".repeat(MAX_DIAGNOSTIC_CHARS + 10);
        let out = truncate_diagnostic(&long);
        assert!(out.ends_with("...(truncated)"));
        assert_eq!(truncate_diagnostic("short"), "short");
    }

    #[tokio::test]
    async fn test_missing_runtime_fails_pull() {
        let launcher = ContainerLauncher::new("/nonexistent/container-runtime");
        let err = launcher.launch(&spec(&[])).await.err().unwrap();
        assert!(matches!(err, HostError::ImagePullFailed { .. }));
    }
}
