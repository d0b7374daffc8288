//! Per-channel table of requests awaiting a response.
//!
//! Every registered call terminates exactly once: either the reader loop
//! resolves it with a matching response, or its deadline expires it. Both
//! paths remove the entry under the same lock, so whichever gets there
//! first wins and the other becomes a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

use super::errors::HostError;
use super::types::JsonRpcResponse;

/// A call registered in a [`PendingTable`], waiting for its response.
#[derive(Debug)]
pub struct PendingCall {
    pub id: u64,
    pub deadline: Instant,
    timeout: Duration,
    result_sink: oneshot::Receiver<JsonRpcResponse>,
}

/// Request-id allocation and response correlation for one channel.
#[derive(Debug)]
pub struct PendingTable {
    server_name: String,
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingTable {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            next_id: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a request id, unique among this channel's outstanding calls.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `id` with a deadline `timeout` from now.
    pub async fn register(&self, id: u64, timeout: Duration) -> Result<PendingCall, HostError> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().await;
        if waiters.contains_key(&id) {
            return Err(HostError::TransportError {
                server: self.server_name.clone(),
                reason: format!("request id {id} is already outstanding"),
            });
        }
        waiters.insert(id, tx);
        Ok(PendingCall {
            id,
            deadline: Instant::now() + timeout,
            timeout,
            result_sink: rx,
        })
    }

    /// Hand `response` to the caller waiting on its id.
    ///
    /// Returns `false` for unknown ids (late, duplicate, or unsolicited).
    pub async fn resolve(&self, response: JsonRpcResponse) -> bool {
        let id = response.id;
        let sender = self.waiters.lock().await.remove(&id);
        match sender {
            // The receiver may already be gone if its task was cancelled.
            Some(tx) => tx.send(response).is_ok(),
            None => {
                tracing::trace!(
                    server = %self.server_name,
                    id,
                    "discarding response with no pending request"
                );
                false
            }
        }
    }

    /// Remove `id` because its deadline passed. `false` if already resolved.
    pub async fn expire(&self, id: u64) -> bool {
        self.waiters.lock().await.remove(&id).is_some()
    }

    /// Drop a registration whose request never reached the sub-server.
    pub async fn cancel(&self, id: u64) {
        self.waiters.lock().await.remove(&id);
    }

    /// Wait for `call` to be resolved or to reach its deadline.
    pub async fn wait(&self, call: PendingCall, target: &str) -> Result<JsonRpcResponse, HostError> {
        let PendingCall {
            id,
            deadline,
            timeout,
            mut result_sink,
        } = call;

        match tokio::time::timeout_at(deadline, &mut result_sink).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(HostError::TransportError {
                server: self.server_name.clone(),
                reason: format!("request {id} was abandoned by the channel"),
            }),
            Err(_) => {
                if self.expire(id).await {
                    return Err(self.timeout_error(target, timeout));
                }
                // Resolved between the deadline firing and the expiry taking
                // the lock: the response is already in the sink.
                result_sink
                    .try_recv()
                    .map_err(|_| self.timeout_error(target, timeout))
            }
        }
    }

    /// Number of calls currently outstanding.
    pub async fn len(&self) -> usize {
        self.waiters.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn timeout_error(&self, target: &str, timeout: Duration) -> HostError {
        HostError::CallTimeout {
            server: self.server_name.clone(),
            target: target.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
