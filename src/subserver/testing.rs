//! In-memory sub-servers for exercising the host without a container runtime.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{oneshot, Notify};

use super::errors::HostError;
use super::supervisor::{ExitReport, KillHandle, LaunchSpec, ProcessHandle, ProcessLauncher};
use super::types::{error_codes, ToolDescriptor};

type SharedWriter = Arc<tokio::sync::Mutex<DuplexStream>>;

/// Scripted behavior of one stub sub-server.
#[derive(Clone)]
pub struct StubServer {
    tools: Vec<ToolDescriptor>,
    answer_calls: bool,
    answer_discovery: bool,
    discovery_gate: Option<Arc<Notify>>,
    noisy: bool,
    garbled: bool,
}

impl StubServer {
    /// Advertises `tools`; every call echoes its arguments back as the result.
    ///
    /// A numeric `delay_ms` argument delays that one reply.
    pub fn echo(tools: &[&str]) -> Self {
        Self {
            tools: tools
                .iter()
                .map(|t| ToolDescriptor::new(t, &format!("{t} (stub)"), serde_json::json!({"type": "object"})))
                .collect(),
            answer_calls: true,
            answer_discovery: true,
            discovery_gate: None,
            noisy: false,
            garbled: false,
        }
    }

    /// Never answer `tools/call`.
    pub fn silent(mut self) -> Self {
        self.answer_calls = false;
        self
    }

    /// Never answer `tools/list`.
    pub fn mute_discovery(mut self) -> Self {
        self.answer_discovery = false;
        self
    }

    /// Hold the `tools/list` reply until `gate` is notified.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.discovery_gate = Some(gate);
        self
    }

    /// Interleave log lines and malformed JSON with replies.
    pub fn noisy(mut self) -> Self {
        self.noisy = true;
        self
    }

    /// Interleave bytes that are not UTF-8 with replies.
    pub fn garbled(mut self) -> Self {
        self.garbled = true;
        self
    }

    pub fn with_required(mut self, tool: &str, fields: &[&str]) -> Self {
        if let Some(t) = self.tools.iter_mut().find(|t| t.name == tool) {
            t.input_schema = serde_json::json!({"type": "object", "required": fields});
        }
        self
    }
}

/// Launcher that wires stub servers to the host over in-memory pipes.
#[derive(Default)]
pub struct StubLauncher {
    servers: HashMap<String, StubServer>,
    failing_pulls: HashSet<String>,
    launched: Mutex<Vec<LaunchSpec>>,
    crashes: Mutex<HashMap<String, oneshot::Sender<i32>>>,
    requests: Arc<Mutex<Vec<(String, String)>>>,
    killed: Arc<Mutex<HashSet<String>>>,
}

impl StubLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, image: &str, server: StubServer) -> Self {
        self.servers.insert(image.to_string(), server);
        self
    }

    pub fn fail_pull(mut self, image: &str) -> Self {
        self.failing_pulls.insert(image.to_string());
        self
    }

    /// Every launch attempt, including failed ones.
    pub fn launched(&self) -> Vec<LaunchSpec> {
        self.launched.lock().unwrap().clone()
    }

    /// Make the server's process exit on its own with `code`.
    pub fn crash(&self, server_name: &str, code: i32) {
        if let Some(tx) = self.crashes.lock().unwrap().remove(server_name) {
            let _ = tx.send(code);
        }
    }

    /// Number of `method` requests the server has received.
    pub fn requests(&self, server_name: &str, method: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, m)| s == server_name && m == method)
            .count()
    }

    pub fn was_killed(&self, server_name: &str) -> bool {
        self.killed.lock().unwrap().contains(server_name)
    }
}

impl ProcessLauncher for StubLauncher {
    fn launch<'a>(&'a self, spec: &'a LaunchSpec) -> BoxFuture<'a, Result<ProcessHandle, HostError>> {
        Box::pin(async move {
            self.launched.lock().unwrap().push(spec.clone());

            if self.failing_pulls.contains(&spec.image) {
                return Err(HostError::ImagePullFailed {
                    image: spec.image.clone(),
                    reason: "manifest unknown".into(),
                });
            }
            let server = self
                .servers
                .get(&spec.image)
                .cloned()
                .ok_or(HostError::SpawnFailed {
                    name: spec.server_name.clone(),
                    reason: format!("no stub for image '{}'", spec.image),
                })?;

            let (host_stdin, server_stdin) = tokio::io::duplex(64 * 1024);
            let (server_stdout, host_stdout) = tokio::io::duplex(64 * 1024);
            let (exit_tx, exit_rx) = oneshot::channel();
            let (kill, kill_rx) = KillHandle::pair();
            let (crash_tx, crash_rx) = oneshot::channel();
            self.crashes
                .lock()
                .unwrap()
                .insert(spec.server_name.clone(), crash_tx);

            let process = StubProcess {
                name: spec.server_name.clone(),
                server,
                requests: Arc::clone(&self.requests),
                killed: Arc::clone(&self.killed),
            };
            tokio::spawn(process.run(server_stdin, server_stdout, kill_rx, crash_rx, exit_tx));

            Ok(ProcessHandle {
                stdin: Box::new(host_stdin),
                stdout: Box::new(host_stdout),
                stderr: None,
                exited: exit_rx,
                kill,
            })
        })
    }
}

struct StubProcess {
    name: String,
    server: StubServer,
    requests: Arc<Mutex<Vec<(String, String)>>>,
    killed: Arc<Mutex<HashSet<String>>>,
}

impl StubProcess {
    async fn run(
        self,
        stdin: DuplexStream,
        stdout: DuplexStream,
        kill_rx: oneshot::Receiver<()>,
        crash_rx: oneshot::Receiver<i32>,
        exit_tx: oneshot::Sender<ExitReport>,
    ) {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(stdout));
        let killed = Arc::clone(&self.killed);
        let name = self.name.clone();

        let report = tokio::select! {
            _ = self.serve(stdin, Arc::clone(&writer)) => ExitReport { code: Some(0), killed: false },
            _ = kill_rx => {
                killed.lock().unwrap().insert(name);
                ExitReport { code: None, killed: true }
            }
            Ok(code) = crash_rx => ExitReport { code: Some(code), killed: false },
        };
        let _ = writer.lock().await.shutdown().await;
        let _ = exit_tx.send(report);
    }

    async fn serve(&self, stdin: DuplexStream, writer: SharedWriter) {
        let mut lines = BufReader::new(stdin).lines();
        if self.server.noisy {
            write_raw(&writer, "stub server starting up").await;
        }
        if self.server.garbled {
            write_bytes(&writer, b"\xff\xfe\xfd banner\n").await;
        }

        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(request) = serde_json::from_str::<serde_json::Value>(&line) else {
                continue;
            };
            let id = request["id"].clone();
            let method = request["method"].as_str().unwrap_or_default().to_string();
            self.requests
                .lock()
                .unwrap()
                .push((self.name.clone(), method.clone()));

            if self.server.noisy {
                write_raw(&writer, "{not json").await;
                write_raw(&writer, r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{}}"#).await;
            }
            if self.server.garbled {
                write_bytes(&writer, b"log \xff\xfe garbage\n").await;
                write_bytes(&writer, b"{\"id\":\xc3\x28}\n").await;
            }

            match method.as_str() {
                "tools/list" => {
                    if !self.server.answer_discovery {
                        continue;
                    }
                    let gate = self.server.discovery_gate.clone();
                    let result = serde_json::json!({"tools": self.server.tools});
                    let writer = Arc::clone(&writer);
                    tokio::spawn(async move {
                        if let Some(gate) = gate {
                            gate.notified().await;
                        }
                        reply(&writer, id, result).await;
                    });
                }
                "tools/call" => {
                    if !self.server.answer_calls {
                        continue;
                    }
                    let arguments = request["params"]["arguments"].clone();
                    let delay = arguments
                        .get("delay_ms")
                        .and_then(|d| d.as_u64())
                        .unwrap_or(0);
                    let writer = Arc::clone(&writer);
                    tokio::spawn(async move {
                        if delay > 0 {
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                        }
                        reply(&writer, id, arguments).await;
                    });
                }
                _ => {
                    let body = serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": error_codes::METHOD_NOT_FOUND, "message": "Method not found"}
                    });
                    write_raw(&writer, &body.to_string()).await;
                }
            }
        }
    }
}

async fn reply(writer: &SharedWriter, id: serde_json::Value, result: serde_json::Value) {
    let body = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result});
    write_raw(writer, &body.to_string()).await;
}

async fn write_raw(writer: &SharedWriter, line: &str) {
    let mut framed = line.as_bytes().to_vec();
    framed.push(b'\n');
    write_bytes(writer, &framed).await;
}

async fn write_bytes(writer: &SharedWriter, bytes: &[u8]) {
    let mut w = writer.lock().await;
    let _ = w.write_all(bytes).await;
    let _ = w.flush().await;
}
