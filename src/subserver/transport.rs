//! JSON-RPC over stdio transport.
//!
//! One [`StdioChannel`] wraps one sub-process's stdin/stdout for its whole
//! lifetime:
//! - requests are written as one JSON object per line
//! - a single long-lived reader task consumes stdout and dispatches each
//!   response to the [`PendingTable`] by id
//! - anything on stdout that is not a response envelope is dropped, including
//!   lines that are not UTF-8 or exceed [`MAX_LINE_BYTES`]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::errors::HostError;
use super::pending::PendingTable;
use super::types::{error_codes, JsonRpcRequest, JsonRpcResponse};

/// Write half of a sub-process's stdio (its stdin).
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half of a sub-process's stdio (its stdout or stderr).
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Longest stdout line (newline included) the reader will buffer.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

// ─── Channel ────────────────────────────────────────────────────────────────

/// Duplex line-delimited JSON-RPC channel bound to one sub-process.
pub struct StdioChannel {
    server_name: String,
    writer: Mutex<BoxedWriter>,
    pending: PendingTable,
    closed: AtomicBool,
}

impl StdioChannel {
    /// Bind a channel to a process's stdin/stdout and start its reader task.
    pub fn open(server_name: &str, stdin: BoxedWriter, stdout: BoxedReader) -> Arc<Self> {
        Self::open_with_line_limit(server_name, stdin, stdout, MAX_LINE_BYTES)
    }

    /// Like [`StdioChannel::open`], dropping stdout lines longer than `max_line_bytes`.
    pub fn open_with_line_limit(
        server_name: &str,
        stdin: BoxedWriter,
        stdout: BoxedReader,
        max_line_bytes: usize,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(stdin),
            pending: PendingTable::new(server_name),
            closed: AtomicBool::new(false),
        });
        spawn_reader_loop(Arc::clone(&channel), BufReader::new(stdout), max_line_bytes);
        channel
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Whether the reader has seen EOF or a read error.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Write one framed request line. Fire-and-forget: no response is awaited.
    pub async fn send(&self, request: &JsonRpcRequest) -> Result<(), HostError> {
        let mut line = serde_json::to_string(request).map_err(|e| HostError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| HostError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer
            .flush()
            .await
            .map_err(|e| HostError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })?;
        Ok(())
    }

    /// Send a request and wait up to `timeout` for its correlated result.
    ///
    /// Timeouts report `method` as the call target.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, HostError> {
        let id = self.pending.next_id();
        let call = self.pending.register(id, timeout).await?;

        let request = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.send(&request).await {
            self.pending.cancel(id).await;
            return Err(e);
        }

        let response = self.pending.wait(call, method).await?;
        extract_result(response)
    }
}

// ─── Reader ─────────────────────────────────────────────────────────────────

/// Parse one stdout line into a response envelope.
///
/// Returns `None` for non-JSON output, notifications, server-initiated
/// requests, and anything else without a numeric `id`.
pub fn parse_line(line: &str) -> Option<JsonRpcResponse> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<JsonRpcResponse>(trimmed) {
        Ok(resp) if resp.method.is_none() => Some(resp),
        _ => None,
    }
}

/// One newline-terminated chunk of stdout, as seen by [`read_frame`].
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    /// A complete line (or the unterminated tail before EOF) is in the buffer.
    Line,
    /// A line over the limit was skipped; carries its length in bytes.
    Oversized(usize),
    Eof,
}

/// Read up to and including the next `\n` into `buf` without decoding it.
///
/// Never buffers more than `max_len` bytes: the rest of a longer line is
/// consumed and thrown away.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, max_len: usize) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut discarded = 0usize;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (buf.is_empty(), discarded) {
                (true, 0) => Frame::Eof,
                (false, 0) => Frame::Line,
                (_, n) => Frame::Oversized(n),
            });
        }

        let (take, complete) = match available.iter().position(|b| *b == b'\n') {
            Some(idx) => (idx + 1, true),
            None => (available.len(), false),
        };
        if discarded == 0 && buf.len() + take <= max_len {
            buf.extend_from_slice(&available[..take]);
        } else {
            discarded += buf.len() + take;
            buf.clear();
        }
        reader.consume(take);

        if complete {
            return Ok(if discarded == 0 {
                Frame::Line
            } else {
                Frame::Oversized(discarded)
            });
        }
    }
}

/// Spawn the channel's only stdout reader.
///
/// Only EOF or an I/O error ends the loop. Pending calls are left in place
/// when it ends; they fail through their own deadlines.
fn spawn_reader_loop<R>(channel: Arc<StdioChannel>, mut reader: BufReader<R>, max_line_bytes: usize)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut line_buf = Vec::new();

        loop {
            match read_frame(&mut reader, &mut line_buf, max_line_bytes).await {
                Ok(Frame::Eof) => {
                    tracing::info!(server = %channel.server_name, "sub-server stdout closed");
                    break;
                }
                Ok(Frame::Oversized(bytes)) => {
                    tracing::warn!(
                        server = %channel.server_name,
                        bytes,
                        limit = max_line_bytes,
                        "dropping oversized stdout line"
                    );
                }
                Ok(Frame::Line) => match std::str::from_utf8(&line_buf) {
                    Ok(line) => match parse_line(line) {
                        Some(response) => {
                            channel.pending.resolve(response).await;
                        }
                        None => {
                            tracing::trace!(
                                server = %channel.server_name,
                                line = %line.trim_end(),
                                "ignoring non-response stdout line"
                            );
                        }
                    },
                    Err(_) => {
                        tracing::trace!(
                            server = %channel.server_name,
                            bytes = line_buf.len(),
                            "ignoring non-UTF-8 stdout line"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        server = %channel.server_name,
                        error = %e,
                        "sub-server stdout read error"
                    );
                    break;
                }
            }
        }

        channel.closed.store(true, Ordering::Release);
    });
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `HostError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, HostError> {
    if let Some(err) = response.error {
        return Err(HostError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(HostError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
