//! Line-delimited JSON-RPC framing and request correlation
//!
//! Each outbound message is one JSON object per line carrying a numeric `id`.
//! Inbound lines with a matching `id` settle the caller waiting on it. The
//! pending table is owned by one connection; nothing here is process-global.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::BridgeError;

/// JSON-RPC request
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

/// JSON-RPC response
#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    #[allow(dead_code)]
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

/// JSON-RPC error
#[derive(Debug, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i32,
    pub message: String,
}

impl RpcResponse {
    fn into_result(self) -> Result<Value, BridgeError> {
        match self.error {
            Some(err) => Err(BridgeError::ServerError(format!(
                "[{}] {}",
                err.code, err.message
            ))),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Monotonic request ids for one connection
#[derive(Debug)]
pub struct RequestIds {
    next: AtomicU64,
}

impl Default for RequestIds {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl RequestIds {
    /// Create a new RPC request with the next id
    pub fn request(&self, method: &str, params: Value) -> RpcRequest {
        RpcRequest {
            jsonrpc: "2.0",
            id: self.next.fetch_add(1, Ordering::SeqCst),
            method: method.to_string(),
            params,
        }
    }
}

type ResponseSender = oneshot::Sender<Result<Value, BridgeError>>;

/// Correlation table of requests still waiting for a response.
///
/// The lock is never held across an await.
#[derive(Debug, Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<u64, ResponseSender>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u64, ResponseSender>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an id and get the receiver its response will arrive on
    pub fn register(&self, id: u64) -> oneshot::Receiver<Result<Value, BridgeError>> {
        let (tx, rx) = oneshot::channel();
        self.table().insert(id, tx);
        rx
    }

    /// Settle one pending request. Returns false if nobody is waiting on the id.
    pub fn complete(&self, id: u64, result: Result<Value, BridgeError>) -> bool {
        match self.table().remove(&id) {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Drop a pending request without settling it
    pub fn remove(&self, id: u64) -> bool {
        self.table().remove(&id).is_some()
    }

    /// Fail every pending request, returning how many were waiting
    pub fn fail_all(&self, error: impl Fn() -> BridgeError) -> usize {
        let drained: Vec<_> = self.table().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its entry from the pending table when the waiting caller goes
/// away, whether it was settled, timed out, or dropped mid-wait.
struct PendingEntry<'a> {
    pending: &'a PendingRequests,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

/// Send an RPC request and wait for its correlated response
pub async fn send_request(
    outbound: &mpsc::Sender<RpcRequest>,
    pending: &PendingRequests,
    request: RpcRequest,
    timeout: Duration,
) -> Result<Value, BridgeError> {
    let id = request.id;
    let rx = pending.register(id);
    let _entry = PendingEntry { pending, id };

    if outbound.send(request).await.is_err() {
        return Err(BridgeError::Disconnected);
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(BridgeError::Disconnected),
        Err(_) => {
            warn!("Request {} timed out after {:?}", id, timeout);
            Err(BridgeError::Timeout(timeout.as_millis() as u64))
        }
    }
}

/// Spawn the background task that writes requests and routes responses
pub fn spawn_communication_task<W, R>(
    mut outbound: mpsc::Receiver<RpcRequest>,
    pending: PendingRequests,
    writer: W,
    reader: R,
) -> tokio::task::JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut writer = writer;
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            tokio::select! {
                request = outbound.recv() => {
                    match request {
                        Some(req) => {
                            let id = req.id;
                            let json = match serde_json::to_string(&req) {
                                Ok(json) => json + "\n",
                                Err(e) => {
                                    pending.complete(id, Err(e.into()));
                                    continue;
                                }
                            };
                            if writer.write_all(json.as_bytes()).await.is_err()
                                || writer.flush().await.is_err()
                            {
                                pending.complete(id, Err(BridgeError::Disconnected));
                                break;
                            }
                        }
                        // Sender dropped: the owner is shutting down
                        None => break,
                    }
                }

                result = reader.read_line(&mut line) => {
                    match result {
                        Ok(0) => break,
                        Ok(_) => {
                            match serde_json::from_str::<RpcResponse>(line.trim()) {
                                Ok(response) => {
                                    let id = response.id;
                                    if !pending.complete(id, response.into_result()) {
                                        debug!("Dropping response for unknown or expired id {}", id);
                                    }
                                }
                                Err(_) => debug!("Ignoring non-response line: {}", line.trim()),
                            }
                            line.clear();
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        pending.fail_all(|| BridgeError::Disconnected);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, AsyncBufReadExt};

    #[test]
    fn test_request_ids_increment() {
        let ids = RequestIds::default();
        let a = ids.request("tools/list", json!({}));
        let b = ids.request("tools/list", json!({}));
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(a.jsonrpc, "2.0");
    }

    #[test]
    fn test_response_error_mapping() {
        let response: RpcResponse =
            serde_json::from_str(r#"{"id":3,"error":{"code":-32601,"message":"nope"}}"#).unwrap();
        match response.into_result() {
            Err(BridgeError::ServerError(msg)) => assert_eq!(msg, "[-32601] nope"),
            other => panic!("unexpected: {:?}", other),
        }

        let response: RpcResponse = serde_json::from_str(r#"{"id":4}"#).unwrap();
        assert_eq!(response.into_result().unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_pending_fail_all() {
        let pending = PendingRequests::new();
        let rx1 = pending.register(1);
        let rx2 = pending.register(2);
        assert_eq!(pending.len(), 2);

        assert_eq!(pending.fail_all(|| BridgeError::SessionClosed), 2);
        assert!(matches!(rx1.await.unwrap(), Err(BridgeError::SessionClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(BridgeError::SessionClosed)));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_over_duplex() {
        // client side talks to a fake server through two in-memory pipes
        let (client_out, server_in) = duplex(4096);
        let (server_out, client_in) = duplex(4096);

        let pending = PendingRequests::new();
        let (tx, rx) = mpsc::channel(8);
        spawn_communication_task(rx, pending.clone(), client_out, client_in);

        tokio::spawn(async move {
            let mut lines = BufReader::new(server_in).lines();
            let mut out = server_out;
            while let Ok(Some(line)) = lines.next_line().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                let reply = json!({ "id": req["id"], "result": { "echo": req["method"] } });
                out.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
            }
        });

        let ids = RequestIds::default();
        let result = send_request(
            &tx,
            &pending,
            ids.request("ping", json!({})),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(result, json!({ "echo": "ping" }));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let (client_out, _server_in) = duplex(4096);
        let (_server_out, client_in) = duplex(4096);

        let pending = PendingRequests::new();
        let (tx, rx) = mpsc::channel(8);
        spawn_communication_task(rx, pending.clone(), client_out, client_in);

        let ids = RequestIds::default();
        let err = send_request(
            &tx,
            &pending,
            ids.request("slow", json!({})),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, BridgeError::Timeout(50)));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_request_removes_pending_entry() {
        let (client_out, _server_in) = duplex(4096);
        let (_server_out, client_in) = duplex(4096);

        let pending = PendingRequests::new();
        let (tx, rx) = mpsc::channel(8);
        spawn_communication_task(rx, pending.clone(), client_out, client_in);

        let ids = RequestIds::default();
        for _ in 0..3 {
            // the caller gives up long before the request's own timeout
            let abandoned = tokio::time::timeout(
                Duration::from_millis(20),
                send_request(&tx, &pending, ids.request("slow", json!({})), Duration::from_secs(30)),
            )
            .await;
            assert!(abandoned.is_err());
        }

        assert!(pending.is_empty());
    }
}
